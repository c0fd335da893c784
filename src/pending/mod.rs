//! Pending command buffers.
//!
//! Fragments are accumulated and flushed to the execution handler as one
//! batch. Two locks are involved: `state` guards the accumulator (append and
//! take), `send` serialises batches on their way to the handler so that text
//! taken earlier is always sent earlier. `send` is always taken before
//! `state`, never the other way round.
//!
//! An oversized fragment is handed to the handler with `state` still held, so
//! `ScriptExecutionHandler::execute_statement` must not submit to the buffer
//! from the calling thread.

mod storage;

use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use serde_json::Value as JsonValue;
use tracing::{debug, error};

use crate::config::{BridgeConfig, BufferStrategy};
use crate::error::{ConfigError, ExecutionError};
use crate::handler::ScriptExecutionHandler;

pub use storage::{
    Accumulator, Batch, ByteAccumulator, CharAccumulator, ImmediateAccumulator,
    JoinedAccumulator, Push, TextAccumulator, DELIMITER,
};

const START_MARKER: &str = "// [START OF PENDING JAVASCRIPT]\n";
const END_MARKER: &str = "// [END OF PENDING JAVASCRIPT]\n";

pub trait CommandBuffer: Send + Sync {
    /// Queue a fragment. Flushes first when the accumulator cannot take it.
    fn submit(&self, fragment: &str);

    /// Send everything queued so far.
    fn drain(&self);

    /// Drain, then run `fragment` synchronously and return the engine result.
    fn submit_and_execute(&self, fragment: &str) -> Result<JsonValue, ExecutionError>;

    /// Run `script` synchronously without touching the queued fragments.
    fn execute_unbuffered(&self, script: &str) -> Result<JsonValue, ExecutionError>;

    fn has_pending(&self) -> bool;

    fn strategy(&self) -> BufferStrategy;
}

pub type JoinedBuffer = BatchingBuffer<JoinedAccumulator>;
pub type TextBuffer = BatchingBuffer<TextAccumulator>;
pub type CharBuffer = BatchingBuffer<CharAccumulator>;
pub type ByteBuffer = BatchingBuffer<ByteAccumulator>;
pub type ImmediateBuffer = BatchingBuffer<ImmediateAccumulator>;

/// Build the buffer selected by `config.strategy`.
pub fn build(
    config: &BridgeConfig,
    handler: Arc<dyn ScriptExecutionHandler>,
) -> Result<Arc<dyn CommandBuffer>, ConfigError> {
    config.validate()?;
    let size = config.buffer_size;
    let logging = config.interop_logging;

    let buffer: Arc<dyn CommandBuffer> = match config.strategy {
        BufferStrategy::Joined => Arc::new(BatchingBuffer::new(
            BufferStrategy::Joined,
            JoinedAccumulator::default(),
            handler,
            logging,
        )),
        BufferStrategy::Text => Arc::new(BatchingBuffer::new(
            BufferStrategy::Text,
            TextAccumulator::new(size),
            handler,
            logging,
        )),
        BufferStrategy::Chars => Arc::new(BatchingBuffer::new(
            BufferStrategy::Chars,
            CharAccumulator::new(size),
            handler,
            logging,
        )),
        BufferStrategy::Bytes => Arc::new(BatchingBuffer::new(
            BufferStrategy::Bytes,
            ByteAccumulator::new(size),
            handler,
            logging,
        )),
        BufferStrategy::Immediate => Arc::new(BatchingBuffer::new(
            BufferStrategy::Immediate,
            ImmediateAccumulator,
            handler,
            logging,
        )),
    };

    debug!(target: "pending_js", strategy = config.strategy.name(), size, "command buffer ready");
    Ok(buffer)
}

pub struct BatchingBuffer<A> {
    strategy: BufferStrategy,
    state: Mutex<A>,
    send: ReentrantMutex<()>,
    handler: Arc<dyn ScriptExecutionHandler>,
    interop_logging: bool,
}

impl<A: Accumulator> BatchingBuffer<A> {
    pub fn new(
        strategy: BufferStrategy,
        accumulator: A,
        handler: Arc<dyn ScriptExecutionHandler>,
        interop_logging: bool,
    ) -> Self {
        Self {
            strategy,
            state: Mutex::new(accumulator),
            send: ReentrantMutex::new(()),
            handler,
            interop_logging,
        }
    }

    /// `None` when called from inside the engine: whoever holds the send lock
    /// is waiting on the engine, and the handler defers our statements anyway.
    fn send_guard(&self) -> Option<ReentrantMutexGuard<'_, ()>> {
        if self.handler.is_reentrant() {
            None
        } else {
            Some(self.send.lock())
        }
    }

    fn take_pending(&self) -> Option<Batch> {
        let batch = self.state.lock().take();
        batch.map(|batch| self.mark(batch))
    }

    fn mark(&self, batch: Batch) -> Batch {
        if !self.interop_logging {
            return batch;
        }
        match batch {
            Batch::Text(text) => {
                debug!(target: "pending_js", strategy = self.strategy.name(), "flushing\n{text}");
                Batch::Text(format!("{START_MARKER}{text}{END_MARKER}"))
            }
            Batch::Bytes(bytes) => {
                debug!(
                    target: "pending_js",
                    strategy = self.strategy.name(),
                    len = bytes.len(),
                    "flushing byte buffer"
                );
                Batch::Bytes(bytes)
            }
        }
    }

    fn send_statement(&self, batch: Batch) {
        let result = match &batch {
            Batch::Text(text) => self.handler.execute_statement(text),
            Batch::Bytes(bytes) => self.handler.submit_unmarshalled(bytes),
        };
        if let Err(err) = result {
            error!(
                target: "pending_js",
                strategy = self.strategy.name(),
                error = %err,
                "failed to execute pending javascript"
            );
        }
    }

    fn send_with_result(&self, batch: Batch) -> Result<JsonValue, ExecutionError> {
        match &batch {
            Batch::Text(text) => self.handler.execute_with_result(text),
            Batch::Bytes(bytes) => self.handler.execute_unmarshalled(bytes),
        }
    }
}

impl<A: Accumulator + 'static> CommandBuffer for BatchingBuffer<A> {
    fn submit(&self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }

        loop {
            let outcome = self.state.lock().push(fragment);
            match outcome {
                Push::Appended => return,
                Push::Full => {
                    let _send = self.send_guard();
                    if let Some(batch) = self.take_pending() {
                        self.send_statement(batch);
                    }
                }
                Push::Oversized => {
                    let _send = self.send_guard();
                    // Held until the fragment is handed over: a submit that
                    // completes after this one must also run after it.
                    let mut state = self.state.lock();
                    if let Some(batch) = state.take() {
                        self.send_statement(self.mark(batch));
                    }
                    self.send_statement(A::standalone(fragment));
                    return;
                }
            }
        }
    }

    fn drain(&self) {
        let _send = self.send_guard();
        if let Some(batch) = self.take_pending() {
            self.send_statement(batch);
        }
    }

    fn submit_and_execute(&self, fragment: &str) -> Result<JsonValue, ExecutionError> {
        let Some(_send) = self.send_guard() else {
            return Err(ExecutionError::Reentrant);
        };

        if fragment.is_empty() {
            if let Some(batch) = self.take_pending() {
                self.send_statement(batch);
            }
            return Ok(JsonValue::Null);
        }

        let (pending, batch) = {
            let mut state = self.state.lock();
            match state.push(fragment) {
                Push::Appended => (None, state.take()),
                Push::Full | Push::Oversized => (state.take(), Some(A::standalone(fragment))),
            }
        };

        if let Some(pending) = pending {
            let pending = self.mark(pending);
            self.send_statement(pending);
        }
        match batch {
            Some(batch) => {
                let batch = self.mark(batch);
                self.send_with_result(batch)
            }
            None => Ok(JsonValue::Null),
        }
    }

    fn execute_unbuffered(&self, script: &str) -> Result<JsonValue, ExecutionError> {
        let Some(_send) = self.send_guard() else {
            return Err(ExecutionError::Reentrant);
        };
        if self.interop_logging {
            debug!(target: "pending_js", "executing without flush\n{script}");
        }
        self.handler.execute_with_result(script)
    }

    fn has_pending(&self) -> bool {
        !self.state.lock().is_empty()
    }

    fn strategy(&self) -> BufferStrategy {
        self.strategy
    }
}
