//! Error types for the legacy store.

use thiserror::Error;

use crate::ChangeId;

/// Errors that can occur reading or writing the legacy store.
#[derive(Debug, Error)]
pub enum LegacyError {
    /// SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Timestamp column could not be parsed.
    #[error("timestamp parse error: {0}")]
    Timestamp(String),

    /// Change does not exist.
    #[error("change {0} not found")]
    NoSuchChange(ChangeId),

    /// Change already exists.
    #[error("change {0} already exists")]
    ChangeExists(ChangeId),

    /// Change id sequence cannot advance past the largest id.
    #[error("change id sequence exhausted after {0}")]
    SequenceExhausted(u32),

    /// Blocking database task panicked or was cancelled.
    #[error("database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Column holds a value outside its domain.
    #[error("invalid value in column {column}: {value}")]
    InvalidColumn { column: &'static str, value: String },
}
