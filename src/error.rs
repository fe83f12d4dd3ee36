//! Error types for the shim.

use std::path::PathBuf;

use crate::runtime::{ContainerStatus, Operation};

/// Result type alias for shim operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure to create the runtime process.
///
/// Distinguishes problems found before the fork (missing or non-executable
/// binary), the child failing to exec its target, and the parent failing to
/// create a child at all.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The executable does not exist.
    #[error("executable not found: {}", path.display())]
    ExecutableNotFound { path: PathBuf },

    /// The path exists but is not an executable regular file.
    #[error("not executable: {}", path.display())]
    NotExecutable { path: PathBuf },

    /// The child process was created but could not exec its target.
    #[error("child failed to exec {}: {source}", path.display())]
    ChildExec {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The OS refused to create a child process.
    #[error("failed to create child process: {source}")]
    Fork {
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur in the shim.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Operation is not valid from the current lifecycle state.
    #[error("cannot {operation} container in state '{state}'")]
    InvalidState {
        operation: Operation,
        state: ContainerStatus,
    },

    /// No container has been created in this shim yet.
    #[error("no container has been created")]
    NotCreated,

    /// Container ID failed validation.
    #[error("invalid container ID '{id}': {reason}")]
    InvalidContainerId { id: String, reason: String },

    /// Bundle directory is missing or unusable.
    #[error("invalid bundle at {}: {reason}", path.display())]
    InvalidBundle { path: PathBuf, reason: String },

    /// Runtime binary is missing or unusable.
    #[error("invalid runtime at {}: {reason}", path.display())]
    InvalidRuntime { path: PathBuf, reason: String },

    /// The container has no live main process.
    #[error("container is not running (state '{state}')")]
    ContainerNotRunning { state: ContainerStatus },

    // =========================================================================
    // Process Errors
    // =========================================================================
    /// Runtime process could not be created.
    #[error("spawn failed: {0}")]
    Spawn(#[from] SpawnError),

    /// Signal target does not exist (or no longer belongs to the container).
    #[error("no such process: {pid}")]
    NoSuchProcess { pid: u32 },

    /// Not permitted to signal the target.
    #[error("permission denied signalling process {pid}")]
    PermissionDenied { pid: u32 },

    /// Forced termination failed during stop; the container state is unresolved.
    #[error("failed to terminate process {pid}: {reason}")]
    TerminationFailed { pid: u32, reason: String },

    // =========================================================================
    // Exec Errors
    // =========================================================================
    /// A live exec session already uses this ID.
    #[error("exec session '{0}' already exists")]
    DuplicateExecId(String),

    /// Exec session is unknown or already reaped.
    #[error("no such exec session: {0}")]
    NoSuchExec(String),

    /// Command failed validation.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    // =========================================================================
    // Resource Errors
    // =========================================================================
    /// Resource accounting backend failure.
    #[error("resource accounting error: {0}")]
    Resource(String),

    /// Operation not supported by the configured backend.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Bounded wait elapsed. Stop converts this into forced termination.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn invalid_state(operation: Operation, state: ContainerStatus) -> Self {
        Self::InvalidState { operation, state }
    }

    pub(crate) fn poisoned<T>(err: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("lock poisoned: {err}"))
    }
}
