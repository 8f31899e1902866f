//! Error types for protocol parsing and configuration.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("invalid scan policy: {0}")]
    InvalidPolicy(String),

    #[error("invalid severity: {0}")]
    InvalidSeverity(String),

    #[error("invalid priority {0}: must be between 1 and 10")]
    InvalidPriority(i64),

    #[error("invalid configuration value for {key}: {value}")]
    Config { key: String, value: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProtocolError {
    pub fn config(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            value: value.into(),
        }
    }
}
