use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value as JsonValue;

use crate::error::ExecutionError;

/// Channel that hands finished script text to the script engine.
///
/// Implementations may serialise access internally. `execute_statement` is
/// fire-and-forget; `execute_with_result` blocks until the engine answers.
pub trait ScriptExecutionHandler: Send + Sync {
    fn execute_statement(&self, script: &str) -> Result<(), ExecutionError>;

    fn execute_with_result(&self, script: &str) -> Result<JsonValue, ExecutionError>;

    /// Fast path for the byte-buffer strategy: the buffer holds UTF-8 script
    /// text with `;\n` fragment delimiters.
    fn execute_unmarshalled(&self, buffer: &[u8]) -> Result<JsonValue, ExecutionError> {
        let script = std::str::from_utf8(buffer)
            .map_err(|err| ExecutionError::InvalidResult(format!("buffer is not UTF-8: {err}")))?;
        self.execute_with_result(script)
    }

    /// Fire-and-forget counterpart of [`execute_unmarshalled`], used when a
    /// byte batch is flushed by an asynchronous submit.
    ///
    /// [`execute_unmarshalled`]: ScriptExecutionHandler::execute_unmarshalled
    fn submit_unmarshalled(&self, buffer: &[u8]) -> Result<(), ExecutionError> {
        let script = std::str::from_utf8(buffer)
            .map_err(|err| ExecutionError::InvalidResult(format!("buffer is not UTF-8: {err}")))?;
        self.execute_statement(script)
    }

    /// True while the current thread is already inside the engine, e.g. running
    /// a host callback invoked from script. Synchronous execution is refused
    /// there and statements are deferred until the engine is free.
    fn is_reentrant(&self) -> bool {
        false
    }
}

/// Entry points the script-side runtime calls back into.
pub trait HostDispatcher: Send + Sync {
    /// Invoke callback `id` with wire-encoded arguments. Returns the wire value
    /// handed back to script (`null` when nothing is expected).
    fn dispatch_callback(&self, id: u64, args: Vec<JsonValue>, expects_result: bool) -> JsonValue;

    /// A command wrapped with error reporting threw inside the engine.
    fn report_script_error(&self, error_id: u64, message: &str);

    /// A command wrapped with error reporting finished; its record can go.
    fn release_call_record(&self, error_id: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionKind {
    Statement,
    WithResult,
    Unmarshalled,
    UnmarshalledStatement,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedScript {
    pub kind: ExecutionKind,
    pub script: String,
}

type Responder = dyn Fn(&str) -> Result<JsonValue, ExecutionError> + Send + Sync;

/// In-memory handler that records every script it receives.
///
/// Answers synchronous calls through an optional responder, `null` otherwise.
/// Useful for dry runs and tests where no engine is available.
#[derive(Default)]
pub struct RecordingHandler {
    executed: Mutex<Vec<ExecutedScript>>,
    responder: Option<Arc<Responder>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responder(
        responder: impl Fn(&str) -> Result<JsonValue, ExecutionError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
            responder: Some(Arc::new(responder)),
        }
    }

    pub fn executed(&self) -> Vec<ExecutedScript> {
        self.executed.lock().clone()
    }

    /// Every script text received, in order, regardless of how it was sent.
    pub fn scripts(&self) -> Vec<String> {
        self.executed
            .lock()
            .iter()
            .map(|entry| entry.script.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.executed.lock().clear();
    }

    fn record(&self, kind: ExecutionKind, script: &str) {
        self.executed.lock().push(ExecutedScript {
            kind,
            script: script.to_string(),
        });
    }

    fn respond(&self, script: &str) -> Result<JsonValue, ExecutionError> {
        match &self.responder {
            Some(responder) => responder(script),
            None => Ok(JsonValue::Null),
        }
    }
}

impl ScriptExecutionHandler for RecordingHandler {
    fn execute_statement(&self, script: &str) -> Result<(), ExecutionError> {
        self.record(ExecutionKind::Statement, script);
        Ok(())
    }

    fn execute_with_result(&self, script: &str) -> Result<JsonValue, ExecutionError> {
        self.record(ExecutionKind::WithResult, script);
        self.respond(script)
    }

    fn execute_unmarshalled(&self, buffer: &[u8]) -> Result<JsonValue, ExecutionError> {
        let script = String::from_utf8_lossy(buffer);
        self.record(ExecutionKind::Unmarshalled, &script);
        self.respond(&script)
    }

    fn submit_unmarshalled(&self, buffer: &[u8]) -> Result<(), ExecutionError> {
        self.record(ExecutionKind::UnmarshalledStatement, &String::from_utf8_lossy(buffer));
        Ok(())
    }
}
