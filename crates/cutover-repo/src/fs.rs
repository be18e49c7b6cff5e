//! Filesystem-backed repositories.
//!
//! Layout of a repository named `p` under root `r`:
//! - `r/p.git/objects/<xx>/<rest>`: one file per object (loose)
//! - `r/p.git/refs.json`: the ref table
//! - `r/p.git/refs.json.lock`: held while the ref table is being rewritten;
//!   it receives the new table and is renamed over `refs.json` to commit

use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::batch::{apply_to_refs, check_objects};
use crate::{
    BatchRefUpdate, CommandResult, ObjectId, ProjectName, RawObject, RepoError, Repository,
    RepositoryManager,
};

const REPO_SUFFIX: &str = ".git";
const REFS_FILE: &str = "refs.json";
const REFS_LOCK: &str = "refs.json.lock";

/// A repository stored in a directory.
pub struct FsRepository {
    name: ProjectName,
    dir: PathBuf,
}

impl FsRepository {
    fn object_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_string();
        self.dir.join("objects").join(&hex[..2]).join(&hex[2..])
    }

    async fn read_refs(&self) -> Result<BTreeMap<String, ObjectId>, RepoError> {
        match fs::read(self.dir.join(REFS_FILE)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write `bytes` to `path` via a sibling temp file and rename.
    async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), RepoError> {
        static NEXT_TMP: AtomicU64 = AtomicU64::new(0);
        let n = NEXT_TMP.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("tmp{}-{}", std::process::id(), n));
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl Repository for FsRepository {
    fn name(&self) -> &ProjectName {
        &self.name
    }

    async fn exact_ref(&self, name: &str) -> Result<Option<ObjectId>, RepoError> {
        Ok(self.read_refs().await?.get(name).copied())
    }

    async fn refs_by_prefix(&self, prefix: &str) -> Result<BTreeMap<String, ObjectId>, RepoError> {
        let mut refs = self.read_refs().await?;
        refs.retain(|k, _| k.starts_with(prefix));
        Ok(refs)
    }

    async fn read_object(&self, id: &ObjectId) -> Result<Option<RawObject>, RepoError> {
        match fs::read(self.object_path(id)).await {
            Ok(bytes) => Ok(Some(RawObject::decode(id, &bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_objects(&self, objects: Vec<RawObject>) -> Result<(), RepoError> {
        for object in objects {
            let path = self.object_path(&object.id());
            if fs::try_exists(&path).await? {
                continue;
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            Self::write_atomically(&path, &object.encode()).await?;
        }
        Ok(())
    }

    async fn apply_batch(&self, update: &mut BatchRefUpdate) -> Result<(), RepoError> {
        check_objects(self, update).await?;

        let lock_path = self.dir.join(REFS_LOCK);
        let mut lock = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                warn!(repo = %self.name, "ref table is locked by another writer");
                for cmd in &mut update.commands {
                    if cmd.result == CommandResult::NotAttempted {
                        cmd.result = CommandResult::LockFailure;
                    }
                }
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let result = async {
            let mut refs = self.read_refs().await?;
            if !apply_to_refs(&mut refs, update, &HashSet::new()) {
                return Ok(false);
            }
            lock.write_all(&serde_json::to_vec_pretty(&refs)?).await?;
            lock.sync_all().await?;
            Ok::<bool, RepoError>(true)
        }
        .await;

        match result {
            Ok(true) => {
                fs::rename(&lock_path, self.dir.join(REFS_FILE)).await?;
                debug!(repo = %self.name, message = %update.reflog_message, "updated refs");
                Ok(())
            }
            Ok(false) => {
                fs::remove_file(&lock_path).await?;
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&lock_path).await {
                    warn!(repo = %self.name, error = %cleanup, "failed to remove ref lock");
                }
                Err(e)
            }
        }
    }
}

/// Repository manager over a directory of `<name>.git` repositories.
pub struct FsRepositoryManager {
    root: PathBuf,
}

impl FsRepositoryManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn repo_dir(&self, name: &ProjectName) -> PathBuf {
        self.root.join(format!("{}{}", name.as_str(), REPO_SUFFIX))
    }
}

#[async_trait]
impl RepositoryManager for FsRepositoryManager {
    async fn open(&self, name: &ProjectName) -> Result<Arc<dyn Repository>, RepoError> {
        let dir = self.repo_dir(name);
        if !fs::try_exists(&dir).await? {
            return Err(RepoError::RepositoryNotFound(name.to_string()));
        }
        Ok(Arc::new(FsRepository {
            name: name.clone(),
            dir,
        }))
    }

    async fn create(&self, name: &ProjectName) -> Result<Arc<dyn Repository>, RepoError> {
        let dir = self.repo_dir(name);
        if fs::try_exists(&dir).await? {
            return Err(RepoError::RepositoryExists(name.to_string()));
        }
        fs::create_dir_all(dir.join("objects")).await?;
        Ok(Arc::new(FsRepository {
            name: name.clone(),
            dir,
        }))
    }

    async fn list(&self) -> Result<Vec<ProjectName>, RepoError> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            if let Some(name) = file_name.to_str().and_then(|n| n.strip_suffix(REPO_SUFFIX)) {
                names.push(ProjectName::new(name));
            }
        }
        names.sort();
        Ok(names)
    }
}
