//! Error types for the repository layer.

use thiserror::Error;

/// Errors that can occur in repository operations.
#[derive(Debug, Error)]
pub enum RepoError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Repository does not exist.
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    /// Repository already exists.
    #[error("repository already exists: {0}")]
    RepositoryExists(String),

    /// Object could not be found.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// Object bytes could not be decoded.
    #[error("corrupt object {id}: {reason}")]
    CorruptObject { id: String, reason: String },

    /// Malformed object id.
    #[error("invalid object id: {0}")]
    InvalidObjectId(String),

    /// Command with identical old and new values.
    #[error("degenerate command for {0}: old and new values are equal")]
    DegenerateCommand(String),

    /// Chained command does not start where the pending one ends.
    #[error("cannot chain command for {ref_name}: expected old value {expected}, got {actual}")]
    ChainMismatch {
        ref_name: String,
        expected: String,
        actual: String,
    },

    /// Some refs in a batch failed because of lock contention.
    #[error("lock failure updating refs: {}", .refs.join(", "))]
    LockFailure { refs: Vec<String> },

    /// Some refs in a batch were rejected for a reason other than lock contention.
    #[error("batch ref update failed: {0}")]
    BatchFailed(String),

    /// Sequence ref holds a value that is not a counter.
    #[error("invalid sequence value in {ref_name}: {value}")]
    InvalidSequence { ref_name: String, value: String },
}

impl RepoError {
    /// Whether this error only reflects ref-lock contention.
    pub fn is_lock_failure(&self) -> bool {
        matches!(self, RepoError::LockFailure { .. })
    }
}
