use thiserror::Error;

/// Top-level error type for the supervisor
#[derive(Error, Debug)]
pub enum PortShiftError {
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Compose error: {0}")]
    Compose(#[from] ComposeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Generic error: {0}")]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("container not found: {id}")]
    NotFound { id: String },

    #[error("unparseable runtime output: {reason}")]
    Malformed { reason: String },

    #[error("recreate failed for container {id}: {reason}")]
    RecreateFailed { id: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ComposeError {
    #[error("compose file not found: {path}")]
    FileNotFound { path: String },

    #[error("invalid compose file: {reason}")]
    InvalidFormat { reason: String },
}

impl PortShiftError {
    /// True when the underlying cause is a container id that vanished
    /// between operations. Routine during refresh; callers skip the id.
    pub fn is_not_found(&self) -> bool {
        matches!(self, PortShiftError::Runtime(RuntimeError::NotFound { .. }))
    }
}

/// Convenience type alias for supervisor results
pub type Result<T, E = PortShiftError> = std::result::Result<T, E>;
