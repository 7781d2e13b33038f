use std::path::PathBuf;

use thiserror::Error;

/// Setup-time failures. Raised before any address is dispatched; per-address
/// failures are recorded in the result store instead.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid address range `{input}`: {reason}")]
    InvalidRange { input: String, reason: String },

    #[error("address range `{input}` has {len} addresses (max {max})")]
    RangeTooLarge { input: String, len: u64, max: u64 },

    #[error("{name} must be between 1 and {max}, got {value}")]
    InvalidLimit {
        name: &'static str,
        value: usize,
        max: usize,
    },

    #[error("{0} must be greater than zero")]
    InvalidTimeout(&'static str),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("remote command must not be empty")]
    EmptyCommand,

    #[error("a remote command was supplied but no session executor is configured")]
    NoSessionExecutor,

    #[error("failed to read config file {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub(crate) fn range(input: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRange {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}
