//! Switching change ids over to the log-store sequence.

use std::sync::Arc;

use cutover_legacy::LegacyStore;
use cutover_repo::{RepoSequence, RepositoryManager};
use tracing::info;

use crate::MigrationError;
use crate::refs::{CHANGES_SEQUENCE, all_projects};

/// Seeds the log-store change id sequence past the legacy one.
pub struct SequenceAllocator {
    repos: Arc<dyn RepositoryManager>,
}

impl SequenceAllocator {
    pub fn new(repos: Arc<dyn RepositoryManager>) -> Self {
        Self { repos }
    }

    /// Seed the sequence at `legacy_next + gap - 1` and take one id from it.
    ///
    /// The first id the log-store sequence hands out afterwards is at least
    /// `legacy_next + gap`, clear of any id the legacy sequence can still
    /// issue to an in-flight write. Returns the id taken.
    pub async fn reserve_gap(
        &self,
        legacy: &dyn LegacyStore,
        gap: i64,
    ) -> Result<u64, MigrationError> {
        if gap < 0 {
            return Err(MigrationError::Precondition(format!(
                "Sequence gap must be non-negative: {gap}"
            )));
        }
        let legacy_next = legacy.next_change_id().await?;
        let seed = u64::from(legacy_next) + gap.unsigned_abs();
        let seed = seed.saturating_sub(1);

        let sequence = RepoSequence::new(
            Arc::clone(&self.repos),
            all_projects(),
            CHANGES_SEQUENCE,
            1,
        );
        let taken = sequence.next(seed).await?;
        info!(legacy_next, gap, taken, "reserved change id gap");
        Ok(taken)
    }
}
