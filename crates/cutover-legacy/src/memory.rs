//! In-memory legacy store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use cutover_repo::ProjectName;

use crate::{
    Change, ChangeBundle, ChangeId, LegacyError, LegacySource, LegacyStore, LogState, PatchSet,
};

#[derive(Default)]
struct Inner {
    bundles: Mutex<BTreeMap<ChangeId, ChangeBundle>>,
    next_id: AtomicU32,
    opens: AtomicUsize,
}

/// Legacy store held in memory. Clones share the same rows.
#[derive(Clone)]
pub struct MemoryLegacyStore {
    inner: Arc<Inner>,
}

impl Default for MemoryLegacyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLegacyStore {
    pub fn new() -> Self {
        let inner = Inner::default();
        inner.next_id.store(1, Ordering::SeqCst);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Insert a change with all its rows.
    ///
    /// The legacy sequence is moved past the change's id.
    pub fn insert(&self, bundle: ChangeBundle) -> Result<(), LegacyError> {
        let id = bundle.id();
        let mut bundles = self.lock();
        if bundles.contains_key(&id) {
            return Err(LegacyError::ChangeExists(id));
        }
        bundles.insert(id, bundle);
        self.inner.next_id.fetch_max(id.0 + 1, Ordering::SeqCst);
        Ok(())
    }

    /// Modify a change's rows in place, as the serving path would.
    pub fn update<F>(&self, id: ChangeId, f: F) -> Result<(), LegacyError>
    where
        F: FnOnce(&mut ChangeBundle),
    {
        let mut bundles = self.lock();
        let bundle = bundles.get_mut(&id).ok_or(LegacyError::NoSuchChange(id))?;
        f(bundle);
        Ok(())
    }

    /// Current log state of a change.
    pub fn log_state(&self, id: ChangeId) -> Option<LogState> {
        self.lock().get(&id).and_then(|b| b.change.log_state.clone())
    }

    /// How many handles have been opened through [`LegacySource::open`].
    pub fn opens(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ChangeId, ChangeBundle>> {
        self.inner.bundles.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LegacyStore for MemoryLegacyStore {
    async fn all_changes(&self) -> Result<Vec<Change>, LegacyError> {
        Ok(self.lock().values().map(|b| b.change.clone()).collect())
    }

    async fn changes(&self, ids: &[ChangeId]) -> Result<Vec<Change>, LegacyError> {
        let bundles = self.lock();
        let mut out: Vec<Change> = ids
            .iter()
            .filter_map(|id| bundles.get(id).map(|b| b.change.clone()))
            .collect();
        out.sort_by_key(|c| c.id);
        out.dedup_by_key(|c| c.id);
        Ok(out)
    }

    async fn change(&self, id: ChangeId) -> Result<Option<Change>, LegacyError> {
        Ok(self.lock().get(&id).map(|b| b.change.clone()))
    }

    async fn change_ids_by_project(
        &self,
        project: &ProjectName,
    ) -> Result<Vec<ChangeId>, LegacyError> {
        Ok(self
            .lock()
            .values()
            .filter(|b| b.project() == project)
            .map(|b| b.id())
            .collect())
    }

    async fn bundle(&self, id: ChangeId) -> Result<ChangeBundle, LegacyError> {
        self.lock()
            .get(&id)
            .cloned()
            .ok_or(LegacyError::NoSuchChange(id))
    }

    async fn patch_sets(&self, id: ChangeId) -> Result<Vec<PatchSet>, LegacyError> {
        let mut patch_sets = self
            .lock()
            .get(&id)
            .map(|b| b.patch_sets.clone())
            .unwrap_or_default();
        patch_sets.sort_by_key(|ps| ps.id.number);
        Ok(patch_sets)
    }

    async fn next_change_id(&self) -> Result<u32, LegacyError> {
        Ok(self.inner.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn compare_and_set_log_state(
        &self,
        id: ChangeId,
        expected: Option<&LogState>,
        new: Option<&LogState>,
    ) -> Result<bool, LegacyError> {
        let mut bundles = self.lock();
        let bundle = bundles.get_mut(&id).ok_or(LegacyError::NoSuchChange(id))?;
        if bundle.change.log_state.as_ref() != expected {
            return Ok(false);
        }
        bundle.change.log_state = new.cloned();
        Ok(true)
    }
}

#[async_trait]
impl LegacySource for MemoryLegacyStore {
    async fn open(&self) -> Result<Arc<dyn LegacyStore>, LegacyError> {
        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.clone()))
    }
}
