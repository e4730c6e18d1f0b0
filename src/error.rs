//! Error types for the sandbox lifecycle core.

use std::path::PathBuf;

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing pod sandboxes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Sandbox Lifecycle Errors
    // =========================================================================
    /// Sandbox not found.
    #[error("sandbox not found: {0}")]
    SandboxNotFound(String),

    /// Sandbox with this id or name already exists.
    #[error("sandbox already exists: {0}")]
    SandboxAlreadyExists(String),

    /// Invalid sandbox identifier.
    #[error("invalid sandbox ID '{id}': {reason}")]
    InvalidSandboxId { id: String, reason: String },

    /// Sandbox is in wrong state for operation.
    #[error("sandbox '{id}' is in state '{state}', expected '{expected}'")]
    InvalidState {
        id: String,
        state: String,
        expected: String,
    },

    /// Sandbox files could not be provisioned.
    #[error("failed to set up files for sandbox '{id}': {reason}")]
    SetupFailed { id: String, reason: String },

    // =========================================================================
    // Controller Errors
    // =========================================================================
    /// No controller is registered for the sandboxer.
    #[error("no controller registered for sandboxer '{sandboxer}'")]
    ControllerUnavailable { sandboxer: String },

    /// A controller operation failed.
    #[error("controller {operation} failed for sandbox '{id}': {reason}")]
    ControllerFailed {
        id: String,
        operation: String,
        reason: String,
    },

    /// The backend process already exited.
    ///
    /// Returned by controllers from `stop` when there is nothing left to stop.
    /// The sandbox treats it as a successful stop.
    #[error("sandbox '{0}' already exited")]
    AlreadyExited(String),

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    /// Reading or writing a persisted document failed.
    #[error("persistence error at {path}: {reason}")]
    Persistence { path: PathBuf, reason: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Input / Configuration Errors
    // =========================================================================
    /// Invalid input (config, settings blob, names).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Daemon configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if the error reports an operation invoked from the wrong
    /// lifecycle status.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }

    /// Returns true if the error came from the persistence layer.
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence { .. } | Self::Serialization(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
