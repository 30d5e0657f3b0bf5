use std::io;

use thiserror::Error;

/// Result type used across the Beacon core crate.
pub type Result<T> = std::result::Result<T, BeaconError>;

/// Canonical error representation shared by the Beacon crates.
#[derive(Debug, Error)]
pub enum BeaconError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("database error: {0}")]
    DatabaseError(String),

    #[error("migration failed: {0}")]
    MigrationError(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("{0}")]
    GeneralError(String),
}

impl From<serde_json::Error> for BeaconError {
    fn from(err: serde_json::Error) -> Self {
        BeaconError::SerializationError(err.to_string())
    }
}

impl From<sqlx::Error> for BeaconError {
    fn from(err: sqlx::Error) -> Self {
        BeaconError::DatabaseError(err.to_string())
    }
}

impl From<anyhow::Error> for BeaconError {
    fn from(err: anyhow::Error) -> Self {
        BeaconError::GeneralError(err.to_string())
    }
}

/// Dedicated configuration error used by the configuration module.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}
