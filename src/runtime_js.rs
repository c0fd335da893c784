//! Script-side half of the bridge.
//!
//! Engines evaluate [`BRIDGE_BOOTSTRAP`] once before any bridge command. It
//! expects three host functions on the global object:
//!
//! * `__hostDispatch(id, argsJson, expectsResult) -> resultJson`
//! * `__hostReportError(errorId, message)`
//! * `__hostReleaseCall(errorId)`

/// Global holding remote object references, keyed by reference id.
pub const REFERENCE_TABLE: &str = "document.jsObjRef";

/// Error id passed to `callScriptSafe` when error reporting is disabled.
pub const NO_ERROR_ID: i64 = -1;

pub const BRIDGE_BOOTSTRAP: &str = r#"
(() => {
    const global = globalThis;
    if (typeof global.document !== 'object' || global.document === null) {
        global.document = {};
    }
    const document = global.document;

    document.jsObjRef = document.jsObjRef || {};
    const disposedCallbacks = {};
    // Values handed to host callbacks get negative ids so they never collide
    // with ids the host allocates.
    let nextArgumentRef = 0;

    document.getElementByIdSafe = function (id) {
        try {
            if (typeof document.getElementById !== 'function') {
                return null;
            }
            return document.getElementById(id);
        } catch (err) {
            return null;
        }
    };

    const toWire = (value) => {
        if (value === undefined || value === null) {
            return null;
        }
        const kind = typeof value;
        if (kind === 'string' || kind === 'boolean') {
            return value;
        }
        if (kind === 'number') {
            return isFinite(value) ? value : null;
        }
        const refId = --nextArgumentRef;
        document.jsObjRef[String(refId)] = value;
        return { __jsRef: refId, isArray: Array.isArray(value) };
    };

    const fromWire = (value) => {
        if (value === null || typeof value !== 'object') {
            return value;
        }
        if (value.__jsRef !== undefined) {
            const target = document.jsObjRef[String(value.__jsRef)];
            return value.index !== undefined ? target[value.index] : target;
        }
        if (value.__domId !== undefined) {
            return document.getElementByIdSafe(value.__domId);
        }
        return value;
    };

    document.eventCallback = function (id, args, expectsResult) {
        if (disposedCallbacks[id]) {
            return undefined;
        }
        const wireArgs = [];
        for (let i = 0; i < args.length; i++) {
            wireArgs.push(toWire(args[i]));
        }
        const result = global.__hostDispatch(id, JSON.stringify(wireArgs), !!expectsResult);
        if (!expectsResult) {
            return undefined;
        }
        return fromWire(JSON.parse(result));
    };

    document.cleanupCallbackFunc = function (id) {
        disposedCallbacks[id] = true;
    };

    document.callScriptSafe = function (refId, code, errorId) {
        try {
            const result = (0, eval)(code);
            document.jsObjRef[refId] = result;
            if (errorId >= 0) {
                global.__hostReleaseCall(errorId);
            }
            return result;
        } catch (err) {
            if (errorId >= 0) {
                let message = String(err);
                if (err && err.stack) {
                    message += '\n' + err.stack;
                }
                global.__hostReportError(errorId, message);
                return undefined;
            }
            throw err;
        }
    };

    // Result encoding for hosts that read values back as JSON text. Objects
    // and arrays stay in the engine; only their shape crosses.
    global.__encodeForHost = function (value) {
        if (value === undefined || value === null) {
            return 'null';
        }
        const kind = typeof value;
        if (kind === 'string' || kind === 'boolean') {
            return JSON.stringify(value);
        }
        if (kind === 'number') {
            return isFinite(value) ? JSON.stringify(value) : 'null';
        }
        if (Array.isArray(value)) {
            return '[]';
        }
        if (kind === 'object' || kind === 'function') {
            return '{}';
        }
        return 'null';
    };
})();
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_defines_runtime_contract() {
        for name in [
            "document.jsObjRef",
            "document.getElementByIdSafe",
            "document.eventCallback",
            "document.cleanupCallbackFunc",
            "document.callScriptSafe",
            "global.__encodeForHost",
            "global.__hostDispatch(",
            "global.__hostReportError(",
            "global.__hostReleaseCall(",
        ] {
            assert!(BRIDGE_BOOTSTRAP.contains(name), "missing {name}");
        }
        assert!(BRIDGE_BOOTSTRAP.contains(REFERENCE_TABLE));
    }
}
