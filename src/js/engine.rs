use std::sync::{Arc, Weak};

use anyhow::{Context as AnyhowContext, Result};
use parking_lot::Mutex;
use rquickjs::{Context, Ctx, Error as JsError, Function, Runtime, Value};
use serde_json::Value as JsonValue;

use crate::handler::HostDispatcher;
use crate::runtime_js::BRIDGE_BOOTSTRAP;

/// Dispatcher shared between the handler and the engine's host functions.
pub(crate) type DispatcherSlot = Arc<Mutex<Option<Weak<dyn HostDispatcher>>>>;

const BRIDGE_SOURCE_URL: &str = "htmlbridge://interop";
const MAX_PENDING_JOBS: usize = 1000;

/// JavaScript runtime backed by QuickJS.
///
/// Installs a `console` that forwards to `tracing`, the host functions the
/// bridge runtime calls back into, and the bridge runtime itself.
pub struct QuickJsEngine {
    runtime: Runtime,
    context: Context,
}

impl QuickJsEngine {
    pub(crate) fn new(dispatcher: DispatcherSlot) -> Result<Self> {
        let runtime = Runtime::new().context("failed to create QuickJS runtime")?;
        let context = Context::full(&runtime).context("failed to create QuickJS context")?;
        let engine = Self { runtime, context };
        engine.init_console()?;
        engine.init_host_functions(dispatcher)?;
        engine
            .context
            .with(|ctx| ctx.eval::<(), _>(BRIDGE_BOOTSTRAP.as_bytes()))
            .context("failed to install bridge runtime")?;
        Ok(engine)
    }

    /// Evaluate a script and discard the result.
    pub fn eval_statement(&self, source: &str) -> Result<(), String> {
        let script = Self::with_source_url(source, BRIDGE_SOURCE_URL);
        let outcome = self.context.with(|ctx| {
            ctx.eval::<(), _>(script)
                .map_err(|err| describe_error(&ctx, err))
        });
        self.execute_pending_jobs();
        outcome
    }

    /// Evaluate a script and read its completion value back as JSON.
    pub fn eval_for_host(&self, source: &str) -> Result<JsonValue, String> {
        let script = Self::with_source_url(source, BRIDGE_SOURCE_URL);
        let outcome = self.context.with(|ctx| {
            eval_encoded(&ctx, script).map_err(|err| describe_error(&ctx, err))
        });
        self.execute_pending_jobs();
        let text = outcome?;
        serde_json::from_str(&text).map_err(|err| format!("unreadable result {text:?}: {err}"))
    }

    /// Drain promise continuations queued by the last evaluation.
    fn execute_pending_jobs(&self) {
        let mut job_count = 0;

        while self.runtime.is_job_pending() {
            match self.runtime.execute_pending_job() {
                Ok(true) => {
                    job_count += 1;
                    if job_count >= MAX_PENDING_JOBS {
                        tracing::warn!(
                            target: "quickjs",
                            "Stopped processing jobs after {} iterations (possible infinite loop)",
                            MAX_PENDING_JOBS
                        );
                        break;
                    }
                }
                Ok(false) => break,
                Err(job_exception) => {
                    tracing::error!(target: "quickjs", "Job execution error: {:?}", job_exception);
                    break;
                }
            }
        }

        if job_count > 0 {
            tracing::debug!(target: "quickjs", "Executed {} pending jobs", job_count);
        }
    }

    fn init_console(&self) -> Result<()> {
        self.context
            .with(|ctx| {
                let global = ctx.globals();
                let log_fn = Function::new(ctx.clone(), log_from_js)?.with_name("__hostLog")?;
                global.set("__hostLog", log_fn)?;
                ctx.eval::<(), _>(CONSOLE_BOOTSTRAP.as_bytes())
            })
            .map_err(anyhow::Error::from)
    }

    fn init_host_functions(&self, dispatcher: DispatcherSlot) -> Result<()> {
        self.context
            .with(|ctx| -> rquickjs::Result<()> {
                let global = ctx.globals();

                {
                    let slot = Arc::clone(&dispatcher);
                    let func = Function::new(
                        ctx.clone(),
                        move |id: f64, args: String, expects_result: bool| -> rquickjs::Result<String> {
                            let Some(dispatcher) = current_dispatcher(&slot) else {
                                tracing::warn!(target: "quickjs", id, "callback dispatched with no host attached");
                                return Ok("null".to_string());
                            };
                            let args: Vec<JsonValue> = serde_json::from_str(&args).unwrap_or_default();
                            let result = dispatcher.dispatch_callback(id as u64, args, expects_result);
                            Ok(result.to_string())
                        },
                    )?
                    .with_name("__hostDispatch")?;
                    global.set("__hostDispatch", func)?;
                }

                {
                    let slot = Arc::clone(&dispatcher);
                    let func = Function::new(
                        ctx.clone(),
                        move |error_id: f64, message: String| -> rquickjs::Result<()> {
                            match current_dispatcher(&slot) {
                                Some(dispatcher) => dispatcher.report_script_error(error_id as u64, &message),
                                None => tracing::error!(target: "quickjs", error_id, "{message}"),
                            }
                            Ok(())
                        },
                    )?
                    .with_name("__hostReportError")?;
                    global.set("__hostReportError", func)?;
                }

                {
                    let slot = Arc::clone(&dispatcher);
                    let func = Function::new(ctx.clone(), move |error_id: f64| -> rquickjs::Result<()> {
                        if let Some(dispatcher) = current_dispatcher(&slot) {
                            dispatcher.release_call_record(error_id as u64);
                        }
                        Ok(())
                    })?
                    .with_name("__hostReleaseCall")?;
                    global.set("__hostReleaseCall", func)?;
                }

                Ok(())
            })
            .map_err(anyhow::Error::from)
    }

    fn with_source_url(source: &str, filename: &str) -> Vec<u8> {
        let mut script = String::with_capacity(source.len() + filename.len() + 32);
        script.push_str(source);
        if !source.ends_with('\n') {
            script.push('\n');
        }
        script.push_str("//# sourceURL=");
        script.push_str(filename);
        script.push('\n');
        script.into_bytes()
    }
}

/// The lock is released before the dispatcher runs; callbacks may reach back
/// into the handler.
fn current_dispatcher(slot: &DispatcherSlot) -> Option<Arc<dyn HostDispatcher>> {
    slot.lock().as_ref().and_then(Weak::upgrade)
}

fn eval_encoded<'js>(ctx: &Ctx<'js>, script: Vec<u8>) -> rquickjs::Result<String> {
    let value: Value = ctx.eval(script)?;
    let encode: Function = ctx.globals().get("__encodeForHost")?;
    encode.call((value,))
}

fn describe_error(ctx: &Ctx<'_>, err: JsError) -> String {
    match err {
        JsError::Exception => {
            capture_exception_message(ctx).unwrap_or_else(|| "QuickJS exception".to_string())
        }
        other => other.to_string(),
    }
}

fn log_from_js(message: String) -> rquickjs::Result<()> {
    tracing::info!(target: "quickjs", "{message}");
    Ok(())
}

fn capture_exception_message(ctx: &Ctx<'_>) -> Option<String> {
    let exception: Value = ctx.catch();

    if let Some(obj) = exception.as_object() {
        if let Ok(message) = obj.get::<_, String>("message") {
            let name = obj
                .get::<_, String>("name")
                .unwrap_or_else(|_| "Error".to_string());
            if let Ok(stack) = obj.get::<_, String>("stack") {
                return Some(format!("{name}: {message}\nStack: {stack}"));
            }
            return Some(format!("{name}: {message}"));
        }
    }

    if let Some(text) = exception.as_string().and_then(|s| s.to_string().ok()) {
        return Some(text);
    }
    Some(format!("{:?}", exception))
}

const CONSOLE_BOOTSTRAP: &str = r#"
(() => {
    const global = globalThis;
    const stringify = (value) => {
        try {
            if (typeof value === 'string') {
                return value;
            }
            if (value === undefined) {
                return 'undefined';
            }
            if (value === null) {
                return 'null';
            }
            return String(value);
        } catch (err) {
            return '[unprintable]';
        }
    };

    const logImpl = (...args) => {
        try {
            global.__hostLog(args.map(stringify).join(' '));
        } catch (err) {
            // console must never throw
        }
    };

    if (typeof global.console !== 'object' || global.console === null) {
        global.console = {};
    }
    global.console.log = logImpl;
    global.console.error = logImpl;
    global.console.warn = logImpl;
    global.console.info = logImpl;
    global.console.debug = logImpl;
})();
"#;
