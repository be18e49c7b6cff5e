//! Repository and repository manager traits.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{BatchRefUpdate, Commit, ObjectId, RawObject, RepoError};

/// Name of a repository (project).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectName(String);

impl ProjectName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A single repository: an object database plus a ref database.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Name of this repository.
    fn name(&self) -> &ProjectName;

    /// Read the current value of a ref.
    async fn exact_ref(&self, name: &str) -> Result<Option<ObjectId>, RepoError>;

    /// Read all refs starting with `prefix`.
    async fn refs_by_prefix(&self, prefix: &str) -> Result<BTreeMap<String, ObjectId>, RepoError>;

    /// Read an object, if present.
    async fn read_object(&self, id: &ObjectId) -> Result<Option<RawObject>, RepoError>;

    /// Write objects to the object database. Existing objects are skipped.
    async fn write_objects(&self, objects: Vec<RawObject>) -> Result<(), RepoError>;

    /// Apply a batch of ref updates, recording a result on every command.
    async fn apply_batch(&self, update: &mut BatchRefUpdate) -> Result<(), RepoError>;

    /// Whether an object exists.
    async fn has_object(&self, id: &ObjectId) -> Result<bool, RepoError> {
        Ok(self.read_object(id).await?.is_some())
    }

    /// Read and decode a commit.
    async fn read_commit(&self, id: &ObjectId) -> Result<Commit, RepoError> {
        let raw = self
            .read_object(id)
            .await?
            .ok_or_else(|| RepoError::ObjectNotFound(id.to_string()))?;
        Commit::parse(id, &raw)
    }

    /// Whether `ancestor` is reachable from `tip` through commit parents.
    async fn is_ancestor(&self, ancestor: &ObjectId, tip: &ObjectId) -> Result<bool, RepoError> {
        let mut stack = vec![*tip];
        let mut seen = std::collections::HashSet::new();
        while let Some(id) = stack.pop() {
            if id == *ancestor {
                return Ok(true);
            }
            if !seen.insert(id) {
                continue;
            }
            match self.read_object(&id).await? {
                Some(raw) if raw.kind == crate::ObjectKind::Commit => {
                    stack.extend(Commit::parse(&id, &raw)?.parents);
                }
                _ => {}
            }
        }
        Ok(false)
    }
}

/// Opens repositories by project name.
#[async_trait]
pub trait RepositoryManager: Send + Sync {
    /// Open an existing repository.
    ///
    /// Fails with [`RepoError::RepositoryNotFound`] when the project does not exist.
    async fn open(&self, name: &ProjectName) -> Result<Arc<dyn Repository>, RepoError>;

    /// Create a new, empty repository.
    async fn create(&self, name: &ProjectName) -> Result<Arc<dyn Repository>, RepoError>;

    /// List all repositories.
    async fn list(&self) -> Result<Vec<ProjectName>, RepoError>;
}
