// Library exports for the host/script interop bridge

pub mod callback;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod handler;
pub mod ids;
pub mod interop;
#[cfg(feature = "quickjs")]
pub mod js;
pub mod loader;
pub mod marshal;
pub mod pending;
pub mod runtime_js;
pub mod store;

// Re-export commonly used types for tests
pub use callback::{CallbackHandle, CallbackRegistry, ReturnKind};
pub use config::{BridgeConfig, BufferStrategy};
pub use error::{BridgeError, ConfigError, ExecutionError};
pub use handler::{HostDispatcher, ScriptExecutionHandler};
pub use diagnostics::{ErrorReporter, ScriptDiagnostic};
pub use interop::{ExecuteOptions, FetcherKind, Interop, ScriptResult};
pub use loader::FileLoadCoordinator;
pub use marshal::{DomElementRef, RemoteObjectRef, ScriptExpression, ScriptValue, ValueMarshaler};
pub use pending::CommandBuffer;
pub use store::SynchronizedStore;
