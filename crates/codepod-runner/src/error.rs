//! Runner-specific errors

use thiserror::Error;

/// Runner errors
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Engine-side failure
    #[error(transparent)]
    Engine(#[from] codepod_engine::EngineError),

    /// Server client failure
    #[error(transparent)]
    Client(#[from] crate::client::ClientError),

    /// Sandbox not found on this runner
    #[error("sandbox not found: {0}")]
    SandboxNotFound(String),

    /// Invalid memory specification
    #[error("invalid memory value '{value}': {reason}")]
    InvalidMemory { value: String, reason: String },

    /// Missing or invalid configuration (fatal at startup)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Failed to read the agent binary for injection
    #[error("failed to read agent binary at {path}: {source}")]
    AgentBinary {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl RunnerError {
    /// True when the underlying cause is a missing sandbox/container
    pub fn is_not_found(&self) -> bool {
        match self {
            RunnerError::SandboxNotFound(_) => true,
            RunnerError::Engine(e) => e.is_not_found(),
            _ => false,
        }
    }
}

pub type Result<T, E = RunnerError> = std::result::Result<T, E>;
