//! Legacy store traits.

use std::sync::Arc;

use async_trait::async_trait;
use cutover_repo::ProjectName;

use crate::{Change, ChangeBundle, ChangeId, LegacyError, LogState, PatchSet};

/// Read access to the legacy store, plus the one write the migrator makes:
/// compare-and-set of a change's [`LogState`].
#[async_trait]
pub trait LegacyStore: Send + Sync {
    /// Every change, ordered by id.
    async fn all_changes(&self) -> Result<Vec<Change>, LegacyError>;

    /// The given changes that exist, ordered by id.
    async fn changes(&self, ids: &[ChangeId]) -> Result<Vec<Change>, LegacyError>;

    /// A single change.
    async fn change(&self, id: ChangeId) -> Result<Option<Change>, LegacyError>;

    /// Ids of the changes in a project, ordered.
    async fn change_ids_by_project(&self, project: &ProjectName)
    -> Result<Vec<ChangeId>, LegacyError>;

    /// All rows belonging to a change.
    ///
    /// Fails with [`LegacyError::NoSuchChange`] when the change does not exist.
    async fn bundle(&self, id: ChangeId) -> Result<ChangeBundle, LegacyError>;

    /// Patch sets of a change, ordered by number.
    async fn patch_sets(&self, id: ChangeId) -> Result<Vec<PatchSet>, LegacyError>;

    /// Allocate the next change id from the legacy sequence.
    async fn next_change_id(&self) -> Result<u32, LegacyError>;

    /// Replace a change's log state if it still equals `expected`.
    ///
    /// Returns `false` if the stored value differs. Fails with
    /// [`LegacyError::NoSuchChange`] when the change does not exist.
    async fn compare_and_set_log_state(
        &self,
        id: ChangeId,
        expected: Option<&LogState>,
        new: Option<&LogState>,
    ) -> Result<bool, LegacyError>;

    /// Ids of every change, ordered.
    async fn all_change_ids(&self) -> Result<Vec<ChangeId>, LegacyError> {
        Ok(self.all_changes().await?.into_iter().map(|c| c.id).collect())
    }
}

/// Opens legacy store handles.
///
/// Opening must be cheap: every worker task opens its own handle.
#[async_trait]
pub trait LegacySource: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn LegacyStore>, LegacyError>;
}
