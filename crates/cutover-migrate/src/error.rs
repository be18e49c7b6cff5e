//! Error types for the migrator.

use chrono::{DateTime, Utc};
use cutover_legacy::{ChangeId, LegacyError};
use cutover_repo::RepoError;
use cutover_state::StateStoreError;
use thiserror::Error;

/// Errors returned by [`Migrator::migrate`](crate::Migrator::migrate) and
/// [`Migrator::rebuild`](crate::Migrator::rebuild).
///
/// Per-change problems never surface here directly; they are logged and
/// folded into [`MigrationError::RebuildFailed`] or
/// [`MigrationError::PrimaryStorageFailed`].
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The request or the current state does not permit the operation.
    #[error("{0}")]
    Precondition(String),

    /// Loading or saving the migration state failed.
    #[error(transparent)]
    StateStore(#[from] StateStoreError),

    /// The state on disk is not one the migrator can start from.
    #[error("migration out of the following state is not supported: {0}")]
    UnsupportedState(String),

    /// Legacy store error outside any per-change task.
    #[error("legacy store error: {0}")]
    Legacy(#[from] LegacyError),

    /// Repository error outside any per-change task.
    #[error("repository error: {0}")]
    Repo(#[from] RepoError),

    /// At least one change or project failed to rebuild.
    #[error("Rebuilding some changes failed, see log")]
    RebuildFailed,

    /// At least one change failed to move to log-store primary.
    #[error("Migrating primary storage for some changes failed, see log")]
    PrimaryStorageFailed,
}

/// Errors rebuilding a single change.
#[derive(Debug, Error)]
pub enum RebuildError {
    /// The change has no patch sets, so there is nothing to rebuild from.
    #[error("change {0} has no patch sets")]
    NoPatchSets(ChangeId),

    /// The legacy row changed while the change was being rebuilt.
    #[error("conflicting legacy update for change {0}")]
    ConflictingUpdate(ChangeId),

    /// The change does not exist.
    #[error("change {0} not found")]
    NoSuchChange(ChangeId),

    /// The log store is already primary for the change.
    #[error("change {0} is log-store primary")]
    LogPrimary(ChangeId),

    /// The change holds an active read-only lease.
    #[error("change {0} is read-only")]
    ReadOnly(ChangeId),

    #[error("legacy store error: {0}")]
    Legacy(#[from] LegacyError),

    #[error("repository error: {0}")]
    Repo(#[from] RepoError),
}

impl RebuildError {
    /// Convert a legacy error for `id`, keeping a missing change distinct.
    pub(crate) fn from_legacy(id: ChangeId, err: LegacyError) -> Self {
        match err {
            LegacyError::NoSuchChange(_) => RebuildError::NoSuchChange(id),
            other => RebuildError::Legacy(other),
        }
    }
}

/// Errors moving a single change to log-store primary.
#[derive(Debug, Error)]
pub enum PrimaryStorageError {
    /// The change was never rebuilt into the log store.
    #[error("change {0} has no log state")]
    NoLogState(ChangeId),

    #[error("change {0} not found")]
    NoSuchChange(ChangeId),

    /// Another migrator holds the read-only lease.
    #[error("change {id} is read-only until {until}")]
    ReadOnly { id: ChangeId, until: DateTime<Utc> },

    /// The lease ran out before the primary flag could be flipped.
    #[error("read-only lease on change {id} expired at {until}")]
    LeaseExpired { id: ChangeId, until: DateTime<Utc> },

    /// The log state changed underneath the migrator.
    #[error("state of change {id} changed unexpectedly: {detail}")]
    StateChanged { id: ChangeId, detail: String },

    #[error("rebuild failed: {0}")]
    Rebuild(#[from] RebuildError),

    #[error("legacy store error: {0}")]
    Legacy(#[from] LegacyError),

    #[error("repository error: {0}")]
    Repo(#[from] RepoError),
}
