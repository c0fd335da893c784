use std::path::PathBuf;

use thiserror::Error;

/// Failure reported by a script execution handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("script raised an exception: {0}")]
    Script(String),
    #[error("script engine is not available: {0}")]
    Unavailable(String),
    #[error("synchronous execution requested from inside a script callback")]
    Reentrant,
    #[error("engine returned a result that could not be read: {0}")]
    InvalidResult(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read bridge config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("buffer size must be greater than zero for the {0} strategy")]
    ZeroBufferSize(&'static str),
    #[error("sweep interval must be greater than zero")]
    ZeroSweepInterval,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("`no_impact_on_pending` only has meaning for synchronous execution and cannot be combined with `run_async`")]
    ConflictingOptions,
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(#[from] url::ParseError),
}
