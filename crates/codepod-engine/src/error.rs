//! Engine error taxonomy
//!
//! Callers (the sandbox manager and the runner control loop) branch on these
//! variants: delete-of-missing is absorbed as success, start-of-running is
//! treated as already started.

use thiserror::Error;

/// Container engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    /// Container, image or network not found
    #[error("'{id}' not found: {reason}")]
    NotFound { id: String, reason: String },

    /// Container is already running
    #[error("container '{id}' is already running")]
    Running { id: String },

    /// Container is busy (e.g. removing a running container without force)
    #[error("container '{id}' is busy: {reason}")]
    Busy { id: String, reason: String },

    /// A container with the requested name already exists
    #[error("container name '{name}' already in use")]
    NameConflict { name: String },

    /// Failed to pull image
    #[error("failed to pull image '{image}': {reason}")]
    PullFailed { image: String, reason: String },

    /// Any other engine-side failure
    #[error("engine error: {0}")]
    Engine(String),
}

impl EngineError {
    /// Classify an error as "target does not exist" for retry/absorb logic
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound { .. })
    }

    /// Classify an error as "container already running"
    pub fn is_running(&self) -> bool {
        matches!(self, EngineError::Running { .. })
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
