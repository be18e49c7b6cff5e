//! Ref-backed sequence counter.

use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    BatchRefUpdate, ObjectId, ObjectInserter, ProjectName, RawObject, RepoError, RepositoryManager,
    execute_checked,
};

/// Ref namespace for sequences.
pub const SEQUENCE_REF_PREFIX: &str = "refs/sequences/";

/// Reserved block of ids: `next..limit`.
#[derive(Debug, Default)]
struct Reserved {
    next: u64,
    limit: u64,
}

/// A monotonically increasing counter stored as a blob under `refs/sequences/<name>`.
///
/// The ref always holds the first id that has not been handed out to any
/// process. Each process reserves `batch_size` ids at a time by moving the
/// ref forward with a compare-and-swap update; a lock failure means another
/// process moved it first, and the reservation is retried.
pub struct RepoSequence {
    manager: Arc<dyn RepositoryManager>,
    project: ProjectName,
    name: String,
    batch_size: u64,
    reserved: Mutex<Reserved>,
}

impl RepoSequence {
    pub fn new(
        manager: Arc<dyn RepositoryManager>,
        project: ProjectName,
        name: impl Into<String>,
        batch_size: u64,
    ) -> Self {
        Self {
            manager,
            project,
            name: name.into(),
            batch_size: batch_size.max(1),
            reserved: Mutex::new(Reserved::default()),
        }
    }

    /// Name of the ref holding the counter.
    pub fn ref_name(&self) -> String {
        format!("{}{}", SEQUENCE_REF_PREFIX, self.name)
    }

    /// Return the next id.
    ///
    /// `seed` is the value the counter starts from if the ref does not exist yet.
    pub async fn next(&self, seed: u64) -> Result<u64, RepoError> {
        let mut reserved = self.reserved.lock().await;
        if reserved.next >= reserved.limit {
            let start = self.acquire(seed).await?;
            reserved.next = start;
            reserved.limit = start + self.batch_size;
        }
        let id = reserved.next;
        reserved.next += 1;
        Ok(id)
    }

    /// Current value stored in the ref, if any.
    pub async fn read(&self) -> Result<Option<u64>, RepoError> {
        let repo = self.manager.open(&self.project).await?;
        let ref_name = self.ref_name();
        match repo.exact_ref(&ref_name).await? {
            Some(id) => Ok(Some(self.parse_value(repo.as_ref(), &ref_name, &id).await?)),
            None => Ok(None),
        }
    }

    /// Move the ref forward by one batch, returning the first reserved id.
    async fn acquire(&self, seed: u64) -> Result<u64, RepoError> {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(10),
            max_elapsed_time: Some(Duration::from_secs(20)),
            ..ExponentialBackoff::default()
        };
        backoff::future::retry(policy, || async {
            self.try_acquire(seed).await.map_err(|e| {
                if e.is_lock_failure() {
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
    }

    async fn try_acquire(&self, seed: u64) -> Result<u64, RepoError> {
        let repo = self.manager.open(&self.project).await?;
        let ref_name = self.ref_name();
        let old = repo.exact_ref(&ref_name).await?;
        let start = match &old {
            Some(id) => self.parse_value(repo.as_ref(), &ref_name, id).await?,
            None => seed,
        };
        let limit = start + self.batch_size;

        let ins = ObjectInserter::loose(Arc::clone(&repo));
        let new_id = ins.insert(RawObject::blob(limit.to_string())).await?;
        let update = BatchRefUpdate::new(vec![crate::ReceiveCommand::new(
            ref_name.clone(),
            ObjectId::or_zero(old),
            new_id,
        )])
        .with_allow_non_fast_forward(true)
        .with_reflog_message(format!("Reserve {} ids in {}", self.batch_size, self.name));
        execute_checked(repo.as_ref(), update).await?;

        debug!(sequence = %self.name, start, limit, "reserved sequence block");
        Ok(start)
    }

    async fn parse_value(
        &self,
        repo: &dyn crate::Repository,
        ref_name: &str,
        id: &ObjectId,
    ) -> Result<u64, RepoError> {
        let raw = repo
            .read_object(id)
            .await?
            .ok_or_else(|| RepoError::ObjectNotFound(id.to_string()))?;
        let text = String::from_utf8_lossy(&raw.data).trim().to_string();
        text.parse().map_err(|_| RepoError::InvalidSequence {
            ref_name: ref_name.to_string(),
            value: text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryRepositoryManager;

    async fn manager() -> Arc<MemoryRepositoryManager> {
        let manager = Arc::new(MemoryRepositoryManager::new());
        manager
            .create(&ProjectName::new("All-Projects"))
            .await
            .unwrap();
        manager
    }

    #[tokio::test]
    async fn test_seeds_missing_ref() {
        let manager = manager().await;
        let seq = RepoSequence::new(manager, ProjectName::new("All-Projects"), "changes", 1);
        assert_eq!(seq.read().await.unwrap(), None);
        assert_eq!(seq.next(501).await.unwrap(), 501);
        assert_eq!(seq.read().await.unwrap(), Some(502));
    }

    #[tokio::test]
    async fn test_batches_reservations() {
        let manager = manager().await;
        let seq = RepoSequence::new(
            Arc::clone(&manager) as Arc<dyn RepositoryManager>,
            ProjectName::new("All-Projects"),
            "changes",
            10,
        );
        assert_eq!(seq.next(2).await.unwrap(), 2);
        assert_eq!(seq.next(2).await.unwrap(), 3);
        assert_eq!(seq.read().await.unwrap(), Some(12));
    }

    #[tokio::test]
    async fn test_second_process_continues_after_first() {
        let manager = manager().await;
        let first = RepoSequence::new(
            Arc::clone(&manager) as Arc<dyn RepositoryManager>,
            ProjectName::new("All-Projects"),
            "changes",
            1,
        );
        assert_eq!(first.next(501).await.unwrap(), 501);

        // Seed is ignored once the ref exists.
        let second = RepoSequence::new(manager, ProjectName::new("All-Projects"), "changes", 10);
        assert_eq!(second.next(1).await.unwrap(), 502);
        assert_eq!(second.read().await.unwrap(), Some(512));
    }

    #[tokio::test]
    async fn test_missing_repository_is_permanent() {
        let manager = Arc::new(MemoryRepositoryManager::new());
        let seq = RepoSequence::new(manager, ProjectName::new("All-Projects"), "changes", 1);
        let err = seq.next(1).await.unwrap_err();
        assert!(matches!(err, RepoError::RepositoryNotFound(_)));
    }
}
