//! Per-change cutover to log-store primary.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::ExponentialBackoff;
use chrono::{TimeDelta, Utc};
use cutover_legacy::{AccountId, Change, ChangeId, LegacyStore, LogState};
use cutover_repo::{ObjectId, RepoError, RepositoryManager};
use tracing::{debug, info};

use crate::refs::{all_users, change_meta_ref, draft_refs_prefix, parse_draft_ref};
use crate::{ChangeRebuilder, PrimaryStorageError, RebuildError};

/// How long a change stays read-only while it is cut over.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(60);

/// Attempts at taking the lease before giving up on a racing writer.
const LEASE_ATTEMPTS: usize = 3;

/// Moves single changes from legacy-primary to log-primary.
///
/// The change is made read-only, the log store is brought up to date with
/// the legacy row, and then the primary flag is flipped. Each step is a
/// compare-and-set on the legacy row, so concurrent writers are detected
/// instead of overwritten.
pub struct PrimaryStorageMigrator {
    repos: Arc<dyn RepositoryManager>,
    rebuilder: ChangeRebuilder,
    lease_timeout: Duration,
}

impl PrimaryStorageMigrator {
    pub fn new(repos: Arc<dyn RepositoryManager>) -> Self {
        Self {
            repos,
            rebuilder: ChangeRebuilder::new(),
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
        }
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    /// Make the log store primary for `id`.
    ///
    /// A change already log-primary is left alone. A change that was never
    /// rebuilt fails with [`PrimaryStorageError::NoLogState`].
    #[tracing::instrument(skip(self, store))]
    pub async fn migrate_to_log_primary(
        &self,
        store: &dyn LegacyStore,
        id: ChangeId,
    ) -> Result<(), PrimaryStorageError> {
        let leased_at = Instant::now();
        let Some(leased) = self.set_read_only(store, id).await? else {
            debug!("change is already log-primary");
            return Ok(());
        };
        let rebuilt = self.ensure_rebuilt(store, id, &leased, leased_at).await?;
        self.set_log_primary(store, id, &rebuilt).await?;
        debug!("change is now log-primary");
        Ok(())
    }

    /// Take the read-only lease. Returns `None` if the change is already
    /// log-primary.
    async fn set_read_only(
        &self,
        store: &dyn LegacyStore,
        id: ChangeId,
    ) -> Result<Option<LogState>, PrimaryStorageError> {
        let lease = TimeDelta::from_std(self.lease_timeout).unwrap_or_else(|_| TimeDelta::days(1));
        for _ in 0..LEASE_ATTEMPTS {
            let state = log_state(&load_change(store, id).await?)?;
            // A live lease belongs to another migrator and cannot be taken over.
            let now = Utc::now();
            if let Some(until) = state.read_only_until.filter(|until| now < *until) {
                return Err(PrimaryStorageError::ReadOnly { id, until });
            }
            if state.is_log_primary() {
                return Ok(None);
            }
            let leased = state.clone().with_read_only_until(Some(now + lease));
            if store
                .compare_and_set_log_state(id, Some(&state), Some(&leased))
                .await?
            {
                return Ok(Some(leased));
            }
            debug!(change = %id, "log state changed while taking lease; retrying");
        }
        Err(PrimaryStorageError::StateChanged {
            id,
            detail: "log state kept changing while taking read-only lease".to_string(),
        })
    }

    /// Rebuild the change with the lease held if its refs disagree with the
    /// leased state. Transient failures are retried for half the lease.
    async fn ensure_rebuilt(
        &self,
        store: &dyn LegacyStore,
        id: ChangeId,
        leased: &LogState,
        leased_at: Instant,
    ) -> Result<LogState, PrimaryStorageError> {
        let budget = (self.lease_timeout / 2).saturating_sub(leased_at.elapsed());
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(250),
            max_elapsed_time: Some(budget),
            ..ExponentialBackoff::default()
        };
        backoff::future::retry(policy, || async move {
            self.try_ensure_rebuilt(store, id, leased)
                .await
                .map_err(|e| {
                    if is_transient(&e) {
                        debug!(change = %id, error = %e, "retrying rebuild");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
        })
        .await
    }

    async fn try_ensure_rebuilt(
        &self,
        store: &dyn LegacyStore,
        id: ChangeId,
        leased: &LogState,
    ) -> Result<LogState, PrimaryStorageError> {
        let change = load_change(store, id).await?;
        let state = log_state(&change)?;
        if state.read_only_until != leased.read_only_until {
            return Err(PrimaryStorageError::StateChanged {
                id,
                detail: "read-only lease was replaced".to_string(),
            });
        }

        let meta = self
            .repos
            .open(&change.project)
            .await?
            .exact_ref(&change_meta_ref(id))
            .await?;
        let drafts: BTreeMap<AccountId, ObjectId> = self
            .repos
            .open(&all_users())
            .await?
            .refs_by_prefix(&draft_refs_prefix(id))
            .await?
            .into_iter()
            .filter_map(|(name, oid)| parse_draft_ref(id, &name).map(|account| (account, oid)))
            .collect();
        if state.refs_match(meta, &drafts) {
            return Ok(state);
        }

        info!(change = %id, "log store is out of date; rebuilding before cutover");
        let rebuilt = self
            .rebuilder
            .rebuild_now(store, self.repos.as_ref(), id, true)
            .await?;
        if rebuilt.read_only_until != leased.read_only_until {
            return Err(PrimaryStorageError::StateChanged {
                id,
                detail: "read-only lease changed during rebuild".to_string(),
            });
        }
        Ok(rebuilt)
    }

    async fn set_log_primary(
        &self,
        store: &dyn LegacyStore,
        id: ChangeId,
        rebuilt: &LogState,
    ) -> Result<(), PrimaryStorageError> {
        let state = log_state(&load_change(store, id).await?)?;
        if state != *rebuilt {
            return Err(PrimaryStorageError::StateChanged {
                id,
                detail: "log state changed after rebuild".to_string(),
            });
        }
        if let Some(until) = state.read_only_until.filter(|until| Utc::now() > *until) {
            return Err(PrimaryStorageError::LeaseExpired { id, until });
        }
        if !store
            .compare_and_set_log_state(id, Some(&state), Some(&LogState::log_primary()))
            .await?
        {
            return Err(PrimaryStorageError::StateChanged {
                id,
                detail: "log state changed while setting primary storage".to_string(),
            });
        }
        Ok(())
    }
}

async fn load_change(store: &dyn LegacyStore, id: ChangeId) -> Result<Change, PrimaryStorageError> {
    store
        .change(id)
        .await?
        .ok_or(PrimaryStorageError::NoSuchChange(id))
}

fn log_state(change: &Change) -> Result<LogState, PrimaryStorageError> {
    change
        .log_state
        .clone()
        .ok_or(PrimaryStorageError::NoLogState(change.id))
}

fn is_transient(err: &PrimaryStorageError) -> bool {
    match err {
        PrimaryStorageError::Repo(e) | PrimaryStorageError::Rebuild(RebuildError::Repo(e)) => {
            !matches!(e, RepoError::RepositoryNotFound(_))
        }
        PrimaryStorageError::Legacy(_)
        | PrimaryStorageError::Rebuild(RebuildError::Legacy(_))
        | PrimaryStorageError::Rebuild(RebuildError::ConflictingUpdate(_)) => true,
        _ => false,
    }
}
