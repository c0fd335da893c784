use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const CONFIG_ENV_VAR: &str = "HTMLBRIDGE_CONFIG";

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1000;

/// Storage backing the pending command buffer. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferStrategy {
    /// Growable list of fragments joined on flush.
    Joined,
    /// Text accumulator capped at `buffer_size` bytes.
    Text,
    /// Fixed character buffer of `buffer_size` characters.
    Chars,
    /// Fixed UTF-8 byte buffer handed to the engine without re-encoding.
    Bytes,
    /// No batching, every fragment is sent as soon as it is submitted.
    Immediate,
}

impl BufferStrategy {
    pub fn name(self) -> &'static str {
        match self {
            Self::Joined => "joined",
            Self::Text => "text",
            Self::Chars => "chars",
            Self::Bytes => "bytes",
            Self::Immediate => "immediate",
        }
    }

    fn is_fixed_capacity(self) -> bool {
        matches!(self, Self::Text | Self::Chars | Self::Bytes)
    }
}

impl Default for BufferStrategy {
    fn default() -> Self {
        Self::Text
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub strategy: BufferStrategy,
    pub buffer_size: usize,
    pub sweep_interval_ms: u64,
    pub enable_error_reporting: bool,
    /// Wrap batches in start/end markers and log every script sent.
    pub interop_logging: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            strategy: BufferStrategy::default(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            enable_error_reporting: true,
            interop_logging: false,
        }
    }
}

impl BridgeConfig {
    /// Load from a YAML file. A missing path or file yields the defaults.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config = match config_path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                serde_yaml::from_str(&contents)?
            }
            _ => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Load from the file named by `HTMLBRIDGE_CONFIG`, if set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.strategy.is_fixed_capacity() && self.buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize(self.strategy.name()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::ZeroSweepInterval);
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
