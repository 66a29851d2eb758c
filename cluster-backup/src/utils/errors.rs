//! Error types for the backup orchestrator.

use crate::gateway::GatewayError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    /// Bad target registry or configuration file. Raised before any cluster call.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Local archive I/O failure. Results of the run can't be trusted.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl BackupError {
    pub fn config(msg: impl Into<String>) -> Self {
        BackupError::Config(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
