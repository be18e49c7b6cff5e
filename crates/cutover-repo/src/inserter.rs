//! Object inserters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::{ObjectId, RawObject, RepoError, Repository};

/// How an inserter writes objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// Buffer objects and write them together on [`ObjectInserter::flush`].
    ///
    /// Owned by a single task; one write per flush.
    Packed,
    /// Write every object immediately.
    ///
    /// Safe to share between tasks writing to the same repository.
    Loose,
}

/// Writes objects into a repository's object database.
///
/// Objects inserted into a packed inserter are visible through
/// [`ObjectInserter::read`] before they are flushed, so a caller can stage a
/// chain of commits and only publish refs once everything is written.
pub struct ObjectInserter {
    repo: Arc<dyn Repository>,
    mode: InsertMode,
    pending: Mutex<HashMap<ObjectId, RawObject>>,
}

impl ObjectInserter {
    /// Buffered inserter.
    pub fn packed(repo: Arc<dyn Repository>) -> Self {
        Self::new(repo, InsertMode::Packed)
    }

    /// Write-through inserter.
    pub fn loose(repo: Arc<dyn Repository>) -> Self {
        Self::new(repo, InsertMode::Loose)
    }

    fn new(repo: Arc<dyn Repository>, mode: InsertMode) -> Self {
        Self {
            repo,
            mode,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> InsertMode {
        self.mode
    }

    pub fn repo(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// Insert an object, returning its id.
    pub async fn insert(&self, object: RawObject) -> Result<ObjectId, RepoError> {
        let id = object.id();
        match self.mode {
            InsertMode::Packed => {
                self.lock_pending().insert(id, object);
            }
            InsertMode::Loose => {
                if !self.repo.has_object(&id).await? {
                    self.repo.write_objects(vec![object]).await?;
                }
            }
        }
        Ok(id)
    }

    /// Read an object from the pending buffer or the repository.
    pub async fn read(&self, id: &ObjectId) -> Result<Option<RawObject>, RepoError> {
        let buffered = self.lock_pending().get(id).cloned();
        if buffered.is_some() {
            return Ok(buffered);
        }
        self.repo.read_object(id).await
    }

    /// Write all buffered objects. Returns how many were written.
    pub async fn flush(&self) -> Result<usize, RepoError> {
        let batch: Vec<RawObject> = self.lock_pending().drain().map(|(_, o)| o).collect();
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();
        self.repo.write_objects(batch).await?;
        debug!(repo = %self.repo.name(), count, "flushed objects");
        Ok(count)
    }

    /// Number of objects waiting for a flush.
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<ObjectId, RawObject>> {
        // A poisoned buffer still holds valid objects.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryRepositoryManager, ProjectName, RepositoryManager};

    #[tokio::test]
    async fn test_packed_buffers_until_flush() {
        let manager = MemoryRepositoryManager::new();
        let repo = manager.create(&ProjectName::new("p")).await.unwrap();
        let ins = ObjectInserter::packed(Arc::clone(&repo));

        let id = ins.insert(RawObject::blob("x")).await.unwrap();
        assert!(!repo.has_object(&id).await.unwrap());
        assert!(ins.read(&id).await.unwrap().is_some());
        assert_eq!(ins.pending_count(), 1);

        assert_eq!(ins.flush().await.unwrap(), 1);
        assert!(repo.has_object(&id).await.unwrap());
        assert_eq!(ins.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_loose_writes_immediately() {
        let manager = MemoryRepositoryManager::new();
        let repo = manager.create(&ProjectName::new("p")).await.unwrap();
        let ins = ObjectInserter::loose(Arc::clone(&repo));

        let id = ins.insert(RawObject::blob("x")).await.unwrap();
        assert!(repo.has_object(&id).await.unwrap());
        assert_eq!(ins.flush().await.unwrap(), 0);
    }
}
