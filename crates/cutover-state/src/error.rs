//! Error types for the state store.

use std::path::PathBuf;

use thiserror::Error;

use crate::MigrationState;

/// Error returned by a [`StateChangeListener`](crate::StateChangeListener).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur loading or saving the migration state.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A config file is not valid TOML.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// The overlay could not be serialized.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A key holds a value of the wrong type.
    #[error("invalid value for {key}: expected {expected}, found {found}")]
    InvalidValue {
        key: String,
        expected: &'static str,
        found: String,
    },

    /// The flags on disk do not describe any migration state.
    #[error("unparseable migration state: {0}")]
    Unparseable(String),

    /// The state on disk is not the state the caller expected.
    #[error("cannot move migration state: expected {expected}, found {actual}")]
    StateMismatch {
        expected: MigrationState,
        actual: String,
    },

    /// The requested transition moves backwards.
    #[error("cannot move migration state backwards from {from} to {to}")]
    Regression {
        from: MigrationState,
        to: MigrationState,
    },

    /// A pre-state-change listener rejected the transition.
    #[error("listener {listener} rejected transition: {source}")]
    ListenerRejected {
        listener: String,
        #[source]
        source: BoxError,
    },
}

impl StateStoreError {
    /// Whether this is a compare-and-swap mismatch.
    pub fn is_state_mismatch(&self) -> bool {
        matches!(self, StateStoreError::StateMismatch { .. })
    }
}
