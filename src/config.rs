//! Client configuration, loaded from TOML.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Resending a timed out request takes a fresh request number and
    /// re-signs it.
    pub resign_on_resend: bool,
    /// Building a request fails once this many are outstanding per context.
    pub max_outstanding_requests: usize,
    /// Also verify the sender's signature on transferred items.
    pub verify_originator_signatures: bool,
    /// Below this many available numbers, callers should request more.
    pub numbers_low_watermark: usize,
    pub log: LogConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            resign_on_resend: true,
            max_outstanding_requests: 64,
            verify_originator_signatures: true,
            numbers_low_watermark: 4,
            log: LogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive, overridden by `RUST_LOG`.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
        }
    }
}

impl ClientConfig {
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a limit is zero.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        if config.max_outstanding_requests == 0 {
            return Err(ConfigError::Validation(
                "max_outstanding_requests must be at least 1".to_owned(),
            ));
        }
        Ok(config)
    }
}
