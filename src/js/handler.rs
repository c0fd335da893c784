use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use anyhow::{anyhow, Context, Result};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tracing::{debug, error};

use super::engine::{DispatcherSlot, QuickJsEngine};
use crate::error::ExecutionError;
use crate::handler::{HostDispatcher, ScriptExecutionHandler};

enum Job {
    Statement(String),
    WithResult(String, Sender<Result<JsonValue, ExecutionError>>),
    Shutdown,
}

/// [`ScriptExecutionHandler`] running every script on one QuickJS engine
/// owned by a dedicated thread.
///
/// Host callbacks invoked from script run on that thread. Statements they
/// submit are queued behind the current script; synchronous execution from
/// there is refused with [`ExecutionError::Reentrant`].
pub struct QuickJsHandler {
    jobs: Sender<Job>,
    engine_thread: Mutex<Option<JoinHandle<()>>>,
    engine_thread_id: ThreadId,
    dispatcher: DispatcherSlot,
}

impl QuickJsHandler {
    pub fn new() -> Result<Self> {
        let (jobs, receiver) = channel::unbounded::<Job>();
        let (ready_tx, ready_rx) = channel::bounded::<Result<(), String>>(1);
        let dispatcher: DispatcherSlot = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&dispatcher);
        let engine_thread = thread::Builder::new()
            .name("quickjs-engine".into())
            .spawn(move || run_engine(receiver, slot, ready_tx))
            .context("failed to spawn QuickJS engine thread")?;

        ready_rx
            .recv()
            .map_err(|_| anyhow!("QuickJS engine thread exited during startup"))?
            .map_err(|message| anyhow!(message))?;

        debug!(target: "quickjs", "engine thread ready");
        Ok(Self {
            jobs,
            engine_thread_id: engine_thread.thread().id(),
            engine_thread: Mutex::new(Some(engine_thread)),
            dispatcher,
        })
    }

    /// Receiver of callbacks, error reports and call releases from script.
    pub fn set_dispatcher(&self, dispatcher: Weak<dyn HostDispatcher>) {
        *self.dispatcher.lock() = Some(dispatcher);
    }

    fn send(&self, job: Job) -> Result<(), ExecutionError> {
        self.jobs
            .send(job)
            .map_err(|_| ExecutionError::Unavailable("engine thread has stopped".into()))
    }
}

impl ScriptExecutionHandler for QuickJsHandler {
    fn execute_statement(&self, script: &str) -> Result<(), ExecutionError> {
        self.send(Job::Statement(script.to_string()))
    }

    fn execute_with_result(&self, script: &str) -> Result<JsonValue, ExecutionError> {
        if self.is_reentrant() {
            return Err(ExecutionError::Reentrant);
        }
        let (reply_tx, reply_rx) = channel::bounded(1);
        self.send(Job::WithResult(script.to_string(), reply_tx))?;
        reply_rx
            .recv()
            .map_err(|_| ExecutionError::Unavailable("engine thread dropped the reply".into()))?
    }

    /// Byte batches flushed from inside a callback are queued like statements;
    /// nobody is waiting on their result there.
    fn execute_unmarshalled(&self, buffer: &[u8]) -> Result<JsonValue, ExecutionError> {
        let script = std::str::from_utf8(buffer)
            .map_err(|err| ExecutionError::InvalidResult(format!("buffer is not UTF-8: {err}")))?;
        if self.is_reentrant() {
            self.execute_statement(script)?;
            return Ok(JsonValue::Null);
        }
        self.execute_with_result(script)
    }

    fn is_reentrant(&self) -> bool {
        thread::current().id() == self.engine_thread_id
    }
}

impl Drop for QuickJsHandler {
    fn drop(&mut self) {
        let _ = self.jobs.send(Job::Shutdown);
        if self.is_reentrant() {
            return;
        }
        if let Some(engine_thread) = self.engine_thread.lock().take() {
            let _ = engine_thread.join();
        }
    }
}

fn run_engine(jobs: Receiver<Job>, dispatcher: DispatcherSlot, ready: Sender<Result<(), String>>) {
    let engine = match QuickJsEngine::new(dispatcher) {
        Ok(engine) => {
            let _ = ready.send(Ok(()));
            engine
        }
        Err(err) => {
            let _ = ready.send(Err(format!("{err:#}")));
            return;
        }
    };

    for job in jobs.iter() {
        match job {
            Job::Statement(script) => {
                if let Err(message) = engine.eval_statement(&script) {
                    error!(target: "quickjs", error = %message, "statement failed");
                }
            }
            Job::WithResult(script, reply) => {
                let result = engine.eval_for_host(&script).map_err(ExecutionError::Script);
                let _ = reply.send(result);
            }
            Job::Shutdown => break,
        }
    }
    debug!(target: "quickjs", "engine thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn evaluates_with_result_and_statements_in_order() {
        let handler = QuickJsHandler::new().unwrap();
        handler.execute_statement("var counter = 1;").unwrap();
        handler.execute_statement("counter += 41;").unwrap();
        assert_eq!(handler.execute_with_result("counter").unwrap(), json!(42));
        assert_eq!(handler.execute_with_result("'a' + \"\\\"b\"").unwrap(), json!("a\"b"));
        assert_eq!(handler.execute_with_result("undefined").unwrap(), JsonValue::Null);
        assert_eq!(handler.execute_with_result("({ a: 1 })").unwrap(), json!({}));
        assert_eq!(handler.execute_with_result("[1, 2]").unwrap(), json!([]));
    }

    #[test]
    fn exceptions_become_script_errors() {
        let handler = QuickJsHandler::new().unwrap();
        let err = handler.execute_with_result("missingFunction()").unwrap_err();
        match err {
            ExecutionError::Script(message) => assert!(message.contains("missingFunction")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(handler.execute_with_result("1 + 1").unwrap(), json!(2));
    }

    #[test]
    fn bridge_runtime_is_installed() {
        let handler = QuickJsHandler::new().unwrap();
        let kinds = handler
            .execute_with_result(
                "[typeof document.callScriptSafe, typeof document.eventCallback, \
                 typeof document.getElementByIdSafe('x')].join(',')",
            )
            .unwrap();
        assert_eq!(kinds, json!("function,function,object"));
        assert!(!handler.is_reentrant());
    }

    #[test]
    fn host_functions_are_installed() {
        let handler = QuickJsHandler::new().unwrap();
        let kinds = handler
            .execute_with_result(
                "[typeof __hostDispatch, typeof __hostReportError, typeof __hostReleaseCall].join(',')",
            )
            .unwrap();
        assert_eq!(kinds, json!("function,function,function"));
    }
}
