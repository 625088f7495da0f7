//! Error types for tokenlock

use thiserror::Error;

use crate::domain::locking::LockError;

/// Result type alias using tokenlock's Error
pub type Result<T> = std::result::Result<T, Error>;

/// tokenlock error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Lock errors (E300-E399)
    #[error(transparent)]
    Lock(#[from] LockError),

    // Database errors (E400-E499)
    #[error("Database error: {0}")]
    DatabaseError(String),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Generic errors
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::Lock(err) => err.code(),
            Self::DatabaseError(_) => "E400",
            Self::ConfigError(_) => "E600",
            Self::InvalidInput(_) => "E800",
            Self::Internal(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::Lock(LockError::Conflict(_)) => Some("tokenlock locks list".to_string()),
            Self::Lock(LockError::Storage { .. }) | Self::DatabaseError(_) => {
                Some("tokenlock doctor".to_string())
            }
            Self::ConfigError(_) => Some("tokenlock config list".to_string()),
            _ => None,
        }
    }
}
