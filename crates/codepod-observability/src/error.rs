//! Observability errors

use thiserror::Error;

/// Errors raised while initialising the logging stack
#[derive(Debug, Error)]
pub enum ObservabilityError {
    /// A subscriber was already installed for this process
    #[error("logging already initialised: {0}")]
    AlreadyInitialised(String),

    /// Failed to set up the rolling file appender
    #[error("failed to initialise file logging: {0}")]
    FileLogging(String),

    /// Invalid configuration value
    #[error("invalid logging configuration for {key}: {reason}")]
    InvalidConfig { key: String, reason: String },
}

pub type Result<T, E = ObservabilityError> = std::result::Result<T, E>;
