//! Layout of a site directory.
//!
//! ```text
//! <site>/site.toml        base config
//! <site>/migration.toml   config overlay written by the migrator
//! <site>/legacy.db        legacy SQLite database
//! <site>/git/             log-store repositories
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cutover_legacy::{LegacySource, SqliteLegacySource};
use cutover_migrate::refs::{all_projects, all_users};
use cutover_repo::{FsRepositoryManager, RepoError, RepositoryManager};
use cutover_state::ConfigStateStore;
use miette::{IntoDiagnostic, Result};
use tracing::info;

pub const LEGACY_DB_FILE: &str = "legacy.db";
pub const REPOS_DIR: &str = "git";

/// Handles on everything a migration touches.
pub struct Site {
    pub store: Arc<ConfigStateStore>,
    pub repos: Arc<dyn RepositoryManager>,
    pub legacy: Arc<dyn LegacySource>,
}

impl Site {
    pub async fn open(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(miette::miette!(
                "site directory {} does not exist",
                dir.display()
            ));
        }

        let db_path = dir.join(LEGACY_DB_FILE);
        let legacy = SqliteLegacySource::new(&db_path);
        // Creates the schema if the database is new.
        legacy.open().await.map_err(|e| {
            miette::miette!("failed to open legacy database {}: {}", db_path.display(), e)
        })?;

        let repos: Arc<dyn RepositoryManager> =
            Arc::new(FsRepositoryManager::new(dir.join(REPOS_DIR)));
        for name in [all_projects(), all_users()] {
            match repos.open(&name).await {
                Ok(_) => {}
                Err(RepoError::RepositoryNotFound(_)) => {
                    repos.create(&name).await.into_diagnostic()?;
                    info!(repo = %name, "created repository");
                }
                Err(e) => return Err(miette::miette!("failed to open {}: {}", name, e)),
            }
        }

        let store = ConfigStateStore::open(dir, vec![]).await.into_diagnostic()?;
        Ok(Self {
            store: Arc::new(store),
            repos,
            legacy: Arc::new(legacy),
        })
    }
}

pub fn default_site_dir() -> PathBuf {
    PathBuf::from(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_initializes_site() {
        let dir = tempfile::tempdir().unwrap();
        let site = Site::open(dir.path()).await.unwrap();

        assert!(dir.path().join(LEGACY_DB_FILE).exists());
        assert!(site.repos.open(&all_users()).await.is_ok());
        assert!(site.repos.open(&all_projects()).await.is_ok());

        // Opening again reuses what is there.
        Site::open(dir.path()).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_site_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Site::open(&dir.path().join("nope")).await.is_err());
    }
}
