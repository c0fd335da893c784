//! Correlation of asynchronous script failures with the command that caused
//! them.

use std::fmt;

use tracing::error;

use crate::store::SynchronizedStore;

/// A failed command paired with the engine's error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptDiagnostic {
    pub error_id: u64,
    pub command: String,
    pub message: String,
}

impl fmt::Display for ScriptDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Error in the following javascript code:\n\n{}\n\n----- Error: -----\n\n{}\n",
            self.command, self.message
        )
    }
}

/// Side channel receiving script diagnostics.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, diagnostic: &ScriptDiagnostic);
}

/// Writes diagnostics to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, diagnostic: &ScriptDiagnostic) {
        error!(target: "interop", error_id = diagnostic.error_id, "{diagnostic}");
    }
}

/// Command text of every in-flight call made with error reporting, keyed by
/// the id the script reports back on failure.
#[derive(Default)]
pub struct ErrorReportingStore {
    calls: SynchronizedStore<String>,
}

impl ErrorReportingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, command: &str) -> u64 {
        self.calls.add(command.to_string())
    }

    /// Drop the record for a call that completed. Absent ids are ignored.
    pub fn forget(&self, error_id: u64) {
        self.calls.remove(error_id);
    }

    /// Remove the record for `error_id` and pair it with the engine message.
    /// `None` when the id was never recorded or was already resolved.
    pub fn resolve(&self, error_id: u64, message: &str) -> Option<ScriptDiagnostic> {
        let command = self.calls.remove(error_id)?;
        Some(ScriptDiagnostic {
            error_id,
            command,
            message: message.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
