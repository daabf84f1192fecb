//! Error types for checkpoint and task registry operations

use thiserror::Error;

/// Result type for checkpoint and registry operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur while persisting checkpoints or registry entries
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Checkpoint or registry entry not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A registry entry with this task id already exists
    #[error("Task already registered: {0}")]
    AlreadyExists(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage backend error (usually transient)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid input, e.g. a task id that cannot be used as a storage key
    #[error("Invalid checkpoint data: {0}")]
    Invalid(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CheckpointError {
    /// Whether retrying the same call might succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, CheckpointError::Storage(_) | CheckpointError::Io(_))
    }
}
