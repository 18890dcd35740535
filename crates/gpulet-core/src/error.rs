//! Error types for gpulet

use std::time::Duration;
use thiserror::Error;

/// Main error type for gpulet
#[derive(Error, Debug)]
pub enum GpuletError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The machine could not be reached
    #[error("Transport error: {0}")]
    Transport(String),

    /// The machine refused our credentials
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Device status tool missing or its output unparsable
    #[error("Device status unavailable: {0}")]
    Unavailable(String),

    /// A blocking command did not finish within its bound
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    /// Lost a lock-creation race; only ever seen inside the lock coordinator
    #[error("Lock race on {0}")]
    LockRace(String),

    /// The launch command reported a failure
    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    /// Job queue error
    #[error("Queue error: {0}")]
    Queue(String),

    /// Machine registry error
    #[error("Registry error: {0}")]
    Registry(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GpuletError {
    /// Whether the failure should simply be retried on the next tick
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GpuletError::Transport(_) | GpuletError::Unavailable(_) | GpuletError::Timeout(_)
        )
    }

    /// Whether the session that produced this error can no longer be trusted
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            GpuletError::Transport(_) | GpuletError::Timeout(_) | GpuletError::Auth(_)
        )
    }
}

/// Result type for gpulet operations
pub type GpuletResult<T> = Result<T, GpuletError>;

impl From<serde_json::Error> for GpuletError {
    fn from(err: serde_json::Error) -> Self {
        GpuletError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for GpuletError {
    fn from(err: toml::de::Error) -> Self {
        GpuletError::Config(err.to_string())
    }
}
