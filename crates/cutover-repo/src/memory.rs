//! In-memory repositories.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::batch::{apply_to_refs, check_objects};
use crate::{
    BatchRefUpdate, ObjectId, ProjectName, RawObject, RepoError, Repository, RepositoryManager,
};

/// Repository held entirely in memory.
pub struct MemoryRepository {
    name: ProjectName,
    objects: RwLock<HashMap<ObjectId, RawObject>>,
    refs: Mutex<BTreeMap<String, ObjectId>>,
    /// Refs held locked by a simulated concurrent writer.
    locked: Mutex<HashSet<String>>,
    object_writes: AtomicUsize,
}

impl MemoryRepository {
    pub fn new(name: ProjectName) -> Self {
        Self {
            name,
            objects: RwLock::new(HashMap::new()),
            refs: Mutex::new(BTreeMap::new()),
            locked: Mutex::new(HashSet::new()),
            object_writes: AtomicUsize::new(0),
        }
    }

    /// Hold a ref locked so batch updates touching it fail with a lock failure.
    pub fn lock_ref(&self, name: impl Into<String>) {
        lock(&self.locked).insert(name.into());
    }

    /// Release a ref held by [`MemoryRepository::lock_ref`].
    pub fn unlock_ref(&self, name: &str) {
        lock(&self.locked).remove(name);
    }

    /// Number of `write_objects` calls that stored at least one object.
    pub fn object_writes(&self) -> usize {
        self.object_writes.load(Ordering::SeqCst)
    }

    /// Number of stored objects.
    pub fn object_count(&self) -> usize {
        self.objects.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Snapshot of all refs.
    pub fn all_refs(&self) -> BTreeMap<String, ObjectId> {
        lock(&self.refs).clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl Repository for MemoryRepository {
    fn name(&self) -> &ProjectName {
        &self.name
    }

    async fn exact_ref(&self, name: &str) -> Result<Option<ObjectId>, RepoError> {
        Ok(lock(&self.refs).get(name).copied())
    }

    async fn refs_by_prefix(&self, prefix: &str) -> Result<BTreeMap<String, ObjectId>, RepoError> {
        Ok(lock(&self.refs)
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), *v))
            .collect())
    }

    async fn read_object(&self, id: &ObjectId) -> Result<Option<RawObject>, RepoError> {
        Ok(self
            .objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned())
    }

    async fn write_objects(&self, objects: Vec<RawObject>) -> Result<(), RepoError> {
        let mut store = self.objects.write().unwrap_or_else(|e| e.into_inner());
        let mut wrote = false;
        for object in objects {
            let id = object.id();
            if let std::collections::hash_map::Entry::Vacant(slot) = store.entry(id) {
                slot.insert(object);
                wrote = true;
            }
        }
        if wrote {
            self.object_writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn apply_batch(&self, update: &mut BatchRefUpdate) -> Result<(), RepoError> {
        check_objects(self, update).await?;
        let locked = lock(&self.locked).clone();
        let mut refs = lock(&self.refs);
        apply_to_refs(&mut refs, update, &locked);
        Ok(())
    }
}

/// Repository manager backed by [`MemoryRepository`] instances.
#[derive(Default)]
pub struct MemoryRepositoryManager {
    repos: DashMap<ProjectName, Arc<MemoryRepository>>,
}

impl MemoryRepositoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Concrete handle to a repository, for inspection in tests.
    pub fn get(&self, name: &ProjectName) -> Option<Arc<MemoryRepository>> {
        self.repos.get(name).map(|r| Arc::clone(r.value()))
    }

    /// Remove a repository, as if deleted concurrently.
    pub fn remove(&self, name: &ProjectName) -> bool {
        self.repos.remove(name).is_some()
    }
}

#[async_trait]
impl RepositoryManager for MemoryRepositoryManager {
    async fn open(&self, name: &ProjectName) -> Result<Arc<dyn Repository>, RepoError> {
        self.get(name)
            .map(|r| r as Arc<dyn Repository>)
            .ok_or_else(|| RepoError::RepositoryNotFound(name.to_string()))
    }

    async fn create(&self, name: &ProjectName) -> Result<Arc<dyn Repository>, RepoError> {
        match self.repos.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RepoError::RepositoryExists(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let repo = Arc::new(MemoryRepository::new(name.clone()));
                slot.insert(Arc::clone(&repo));
                Ok(repo)
            }
        }
    }

    async fn list(&self) -> Result<Vec<ProjectName>, RepoError> {
        let mut names: Vec<ProjectName> = self.repos.iter().map(|r| r.key().clone()).collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ReceiveCommand, execute_checked};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_open_missing_repository() {
        let manager = MemoryRepositoryManager::new();
        let err = manager.open(&ProjectName::new("nope")).await.err().unwrap();
        assert!(matches!(err, RepoError::RepositoryNotFound(_)));
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let manager = MemoryRepositoryManager::new();
        manager.create(&ProjectName::new("p")).await.unwrap();
        assert!(manager.create(&ProjectName::new("p")).await.is_err());
        assert_eq!(manager.list().await.unwrap(), vec![ProjectName::new("p")]);
    }

    #[tokio::test]
    async fn test_locked_ref_fails_update() {
        let manager = MemoryRepositoryManager::new();
        let repo = manager.create(&ProjectName::new("p")).await.unwrap();
        let blob = RawObject::blob("v");
        let id = blob.id();
        repo.write_objects(vec![blob]).await.unwrap();

        let concrete = manager.get(&ProjectName::new("p")).unwrap();
        concrete.lock_ref("refs/x");
        let update = BatchRefUpdate::new(vec![ReceiveCommand::new("refs/x", ObjectId::ZERO, id)]);
        let err = execute_checked(repo.as_ref(), update).await.unwrap_err();
        assert!(err.is_lock_failure());

        concrete.unlock_ref("refs/x");
        let update = BatchRefUpdate::new(vec![ReceiveCommand::new("refs/x", ObjectId::ZERO, id)]);
        execute_checked(repo.as_ref(), update).await.unwrap();
    }

    #[tokio::test]
    async fn test_refs_by_prefix() {
        let manager = MemoryRepositoryManager::new();
        let repo = manager.create(&ProjectName::new("p")).await.unwrap();
        let blob = RawObject::blob("v");
        let id = blob.id();
        repo.write_objects(vec![blob]).await.unwrap();
        let update = BatchRefUpdate::new(vec![
            ReceiveCommand::new("refs/a/1", ObjectId::ZERO, id),
            ReceiveCommand::new("refs/a/2", ObjectId::ZERO, id),
            ReceiveCommand::new("refs/b/1", ObjectId::ZERO, id),
        ]);
        execute_checked(repo.as_ref(), update).await.unwrap();

        let refs = repo.refs_by_prefix("refs/a/").await.unwrap();
        assert_eq!(
            refs.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["refs/a/1", "refs/a/2"]
        );
    }
}
