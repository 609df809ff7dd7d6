//! Error types shared across the control plane

use thiserror::Error;

/// Result type alias for control plane operations
pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors surfaced by the executor, the dispatcher collaborators and the
/// lifecycle controllers
#[derive(Debug, Error)]
pub enum ControlError {
    /// Bad name or spec, rejected before any state change
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A job with this name is already in flight
    #[error("Job already running: {0}")]
    AlreadyRunning(String),

    /// The object already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The global ceiling for a resource kind has been reached
    #[error("Capacity exceeded: at most {max} {kind} allowed")]
    CapacityExceeded {
        /// Resource kind (e.g. "clusters")
        kind: &'static str,
        /// Configured maximum
        max: usize,
    },

    /// A job ran past its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A provisioning step exited with a non-zero code
    #[error("External step '{step}' failed with exit code {exit_code}")]
    ExternalFailure {
        /// Name of the step (apply, destroy, ...)
        step: String,
        /// Process exit code
        exit_code: i32,
    },

    /// Unexpected or store failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create an external failure for a named step
    pub fn external(step: impl Into<String>, exit_code: i32) -> Self {
        Self::ExternalFailure {
            step: step.into(),
            exit_code,
        }
    }

    /// Create an internal error from anything displayable
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this error is an "already exists" error
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// AlreadyRunning and AlreadyExists mean the caller's intent is already
    /// being served.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::AlreadyRunning(_) | Self::AlreadyExists(_))
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(err: serde_json::Error) -> Self {
        ControlError::Internal(format!("serialization failed: {}", err))
    }
}
