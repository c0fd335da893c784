//! QuickJS-backed script execution.

mod engine;
mod handler;

pub use engine::QuickJsEngine;
pub use handler::QuickJsHandler;
