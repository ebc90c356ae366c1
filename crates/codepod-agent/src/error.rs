//! Agent-specific errors

use thiserror::Error;

/// Agent runtime errors
#[derive(Debug, Error)]
pub enum AgentError {
    /// Missing or invalid configuration (fatal at startup)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// PTY allocation failed because the host tty table is exhausted
    #[error("pty resources exhausted: {0}")]
    ResourceExhausted(String),

    /// PTY syscall failure
    #[error("pty error: {0}")]
    Pty(String),

    /// Session registry miss
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Session cap reached
    #[error("session limit reached ({limit} active)")]
    SessionLimit { limit: usize },

    /// Process table miss
    #[error("process not found: {0}")]
    ProcessNotFound(String),

    /// Process is not in a killable/waitable state
    #[error("process '{id}' is not running")]
    ProcessNotRunning { id: String },

    /// Deadline elapsed
    #[error("timeout waiting for {0}")]
    Timeout(String),

    /// SSH transport/protocol error
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    /// SSH key handling error
    #[error("ssh key error: {0}")]
    Key(String),

    /// HTTP failure talking to the server
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered a non-2xx status
    #[error("server returned {0}")]
    ServerStatus(u16),

    /// Filesystem error with path context
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::Io {
            path: String::new(),
            source: e,
        }
    }
}

pub type Result<T, E = AgentError> = std::result::Result<T, E>;
