//! Compare-and-swap store for the migration state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{KEY_AUTO_MIGRATE, KEY_INITIAL_SEQUENCE_GAP, KEY_TRIAL};
use crate::{BoxError, ConfigEdit, LayeredConfig, MigrationState, StateStoreError};

/// Base config file in a site directory.
pub const BASE_CONFIG_FILE: &str = "site.toml";

/// Overlay config file in a site directory; the only file the store writes.
pub const OVERLAY_CONFIG_FILE: &str = "migration.toml";

pub const DEFAULT_INITIAL_SEQUENCE_GAP: i64 = 1000;

/// Hook run before every state transition is committed.
///
/// Returning an error aborts the transition; nothing is written.
#[async_trait]
pub trait StateChangeListener: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    async fn before_state_change(
        &self,
        old: MigrationState,
        new: MigrationState,
    ) -> Result<(), BoxError>;
}

/// Owner of the persisted migration state.
///
/// Every read-modify-write of the config files happens under one mutex, which
/// also guards the in-memory copy of the last committed state.
pub struct ConfigStateStore {
    base_path: PathBuf,
    overlay_path: PathBuf,
    listeners: Vec<Arc<dyn StateChangeListener>>,
    /// Last committed state; `None` if the files did not parse at open.
    current: Mutex<Option<MigrationState>>,
}

impl ConfigStateStore {
    /// Open the store over `site.toml` and `migration.toml` in `site_dir`.
    pub async fn open(
        site_dir: impl AsRef<Path>,
        listeners: Vec<Arc<dyn StateChangeListener>>,
    ) -> Result<Self, StateStoreError> {
        let dir = site_dir.as_ref();
        Self::with_paths(
            dir.join(BASE_CONFIG_FILE),
            dir.join(OVERLAY_CONFIG_FILE),
            listeners,
        )
        .await
    }

    pub async fn with_paths(
        base_path: PathBuf,
        overlay_path: PathBuf,
        listeners: Vec<Arc<dyn StateChangeListener>>,
    ) -> Result<Self, StateStoreError> {
        let config = LayeredConfig::load(&base_path, &overlay_path).await?;
        let current = config.state().ok();
        debug!(
            base = %base_path.display(),
            overlay = %overlay_path.display(),
            state = ?current,
            "opened migration state store"
        );
        Ok(Self {
            base_path,
            overlay_path,
            listeners,
            current: Mutex::new(current),
        })
    }

    async fn read_config(&self) -> Result<LayeredConfig, StateStoreError> {
        LayeredConfig::load(&self.base_path, &self.overlay_path).await
    }

    /// Read the state from disk.
    pub async fn load(&self) -> Result<MigrationState, StateStoreError> {
        let mut current = self.current.lock().await;
        let state = self.read_config().await?.state()?;
        *current = Some(state);
        Ok(state)
    }

    /// Last state read or committed by this store.
    pub async fn current(&self) -> Option<MigrationState> {
        *self.current.lock().await
    }

    /// Move from `expected` to `new`, applying `extra` to the overlay in the
    /// same write.
    ///
    /// The state is reloaded from disk first; if it is not `expected` the save
    /// fails with [`StateStoreError::StateMismatch`]. Listeners run after the
    /// check and before the write.
    #[tracing::instrument(skip(self, extra))]
    pub async fn save<F>(
        &self,
        expected: MigrationState,
        new: MigrationState,
        extra: F,
    ) -> Result<MigrationState, StateStoreError>
    where
        F: FnOnce(&mut ConfigEdit) + Send,
    {
        let mut current = self.current.lock().await;
        let mut config = self.read_config().await?;
        let actual = match config.state() {
            Ok(state) => state,
            Err(StateStoreError::Unparseable(flags)) => {
                return Err(StateStoreError::StateMismatch {
                    expected,
                    actual: format!("unparseable ({flags})"),
                });
            }
            Err(e) => return Err(e),
        };
        if actual != expected {
            return Err(StateStoreError::StateMismatch {
                expected,
                actual: actual.to_string(),
            });
        }
        if new < expected {
            return Err(StateStoreError::Regression { from: expected, to: new });
        }

        for listener in &self.listeners {
            listener
                .before_state_change(expected, new)
                .await
                .map_err(|source| StateStoreError::ListenerRejected {
                    listener: listener.name().to_string(),
                    source,
                })?;
        }

        config.edit(|edit| {
            edit.set_state(new);
            extra(edit);
        });
        config.write_overlay(&self.overlay_path).await?;
        *current = Some(new);
        info!(from = %expected, to = %new, "migration state saved");
        Ok(new)
    }

    /// Persist the control flags read by the host at start-up.
    pub async fn set_control_flags(
        &self,
        auto_migrate: bool,
        trial: bool,
    ) -> Result<(), StateStoreError> {
        let _current = self.current.lock().await;
        let mut config = self.read_config().await?;
        config.edit(|edit| {
            edit.set_auto_migrate(auto_migrate);
            edit.set_trial(trial);
        });
        config.write_overlay(&self.overlay_path).await?;
        debug!(auto_migrate, trial, "saved migration control flags");
        Ok(())
    }

    /// Whether the host should resume the migration on start-up.
    pub async fn auto_migrate(&self) -> Result<bool, StateStoreError> {
        let _current = self.current.lock().await;
        self.read_config().await?.get_bool(KEY_AUTO_MIGRATE, false)
    }

    /// Whether the migration stops before the log store becomes primary.
    pub async fn trial(&self) -> Result<bool, StateStoreError> {
        let _current = self.current.lock().await;
        self.read_config().await?.get_bool(KEY_TRIAL, false)
    }

    /// Configured gap between the legacy and log-store change id sequences.
    pub async fn initial_sequence_gap(&self) -> Result<i64, StateStoreError> {
        let _current = self.current.lock().await;
        self.read_config().await?
            .get_int(KEY_INITIAL_SEQUENCE_GAP, DEFAULT_INITIAL_SEQUENCE_GAP)
    }

    pub fn overlay_path(&self) -> &Path {
        &self.overlay_path
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use pretty_assertions::assert_eq;

    struct Recording {
        calls: AtomicUsize,
        reject: bool,
    }

    #[async_trait]
    impl StateChangeListener for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn before_state_change(
            &self,
            _old: MigrationState,
            _new: MigrationState,
        ) -> Result<(), BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.reject {
                return Err("not now".into());
            }
            Ok(())
        }
    }

    fn site() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[tokio::test]
    async fn test_fresh_site_is_legacy() {
        let dir = site();
        let store = ConfigStateStore::open(dir.path(), vec![]).await.unwrap();
        assert_eq!(store.current().await, Some(MigrationState::Legacy));
        assert_eq!(store.load().await.unwrap(), MigrationState::Legacy);
        assert_eq!(store.initial_sequence_gap().await.unwrap(), 1000);
        assert!(!store.auto_migrate().await.unwrap());
    }

    #[tokio::test]
    async fn test_save_moves_forward() {
        let dir = site();
        let store = ConfigStateStore::open(dir.path(), vec![]).await.unwrap();
        store
            .save(MigrationState::Legacy, MigrationState::Write, |_| {})
            .await
            .unwrap();
        assert_eq!(store.current().await, Some(MigrationState::Write));

        let reopened = ConfigStateStore::open(dir.path(), vec![]).await.unwrap();
        assert_eq!(reopened.load().await.unwrap(), MigrationState::Write);
    }

    #[tokio::test]
    async fn test_save_reports_mismatch() {
        let dir = site();
        let store = ConfigStateStore::open(dir.path(), vec![]).await.unwrap();
        let err = store
            .save(MigrationState::Write, MigrationState::ReadWriteNoSequence, |_| {})
            .await
            .unwrap_err();
        match err {
            StateStoreError::StateMismatch { expected, actual } => {
                assert_eq!(expected, MigrationState::Write);
                assert_eq!(actual, "LEGACY");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.current().await, Some(MigrationState::Legacy));
    }

    #[tokio::test]
    async fn test_save_sees_external_writes() {
        let dir = site();
        let first = ConfigStateStore::open(dir.path(), vec![]).await.unwrap();
        let second = ConfigStateStore::open(dir.path(), vec![]).await.unwrap();
        second
            .save(MigrationState::Legacy, MigrationState::Write, |_| {})
            .await
            .unwrap();

        // The first store's cached state is stale; the save must reload.
        let err = first
            .save(MigrationState::Legacy, MigrationState::Write, |_| {})
            .await
            .unwrap_err();
        assert!(err.is_state_mismatch());
    }

    #[tokio::test]
    async fn test_regression_rejected() {
        let dir = site();
        let store = ConfigStateStore::open(dir.path(), vec![]).await.unwrap();
        store
            .save(MigrationState::Legacy, MigrationState::Write, |_| {})
            .await
            .unwrap();
        let err = store
            .save(MigrationState::Write, MigrationState::Legacy, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, StateStoreError::Regression { .. }));
    }

    #[tokio::test]
    async fn test_listener_can_abort() {
        let dir = site();
        let listener = Arc::new(Recording {
            calls: AtomicUsize::new(0),
            reject: true,
        });
        let store = ConfigStateStore::open(
            dir.path(),
            vec![Arc::clone(&listener) as Arc<dyn StateChangeListener>],
        )
        .await
        .unwrap();

        let err = store
            .save(MigrationState::Legacy, MigrationState::Write, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, StateStoreError::ListenerRejected { .. }));
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.load().await.unwrap(), MigrationState::Legacy);
        assert!(!dir.path().join(OVERLAY_CONFIG_FILE).exists());
    }

    #[tokio::test]
    async fn test_extra_mutations_written_with_state() {
        let dir = site();
        let store = ConfigStateStore::open(dir.path(), vec![]).await.unwrap();
        store.set_control_flags(true, true).await.unwrap();
        assert!(store.auto_migrate().await.unwrap());
        assert!(store.trial().await.unwrap());

        store
            .save(MigrationState::Legacy, MigrationState::Write, |edit| {
                edit.set_auto_migrate(false)
            })
            .await
            .unwrap();
        assert!(!store.auto_migrate().await.unwrap());
        assert!(store.trial().await.unwrap());
    }

    #[tokio::test]
    async fn test_unparseable_state_fails_save() {
        let dir = site();
        std::fs::write(
            dir.path().join(BASE_CONFIG_FILE),
            "[log_db.changes]\nread = true\n",
        )
        .unwrap();
        let store = ConfigStateStore::open(dir.path(), vec![]).await.unwrap();
        assert_eq!(store.current().await, None);
        assert!(matches!(
            store.load().await,
            Err(StateStoreError::Unparseable(_))
        ));
        let err = store
            .save(MigrationState::Legacy, MigrationState::Write, |_| {})
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unparseable"));
    }

    #[tokio::test]
    async fn test_overlay_overrides_site_config() {
        let dir = site();
        std::fs::write(
            dir.path().join(BASE_CONFIG_FILE),
            "[log_db.changes]\ninitial_sequence_gap = 50\nwrite = true\n",
        )
        .unwrap();
        let store = ConfigStateStore::open(dir.path(), vec![]).await.unwrap();
        assert_eq!(store.load().await.unwrap(), MigrationState::Write);
        assert_eq!(store.initial_sequence_gap().await.unwrap(), 50);

        store
            .save(MigrationState::Write, MigrationState::ReadWriteNoSequence, |_| {})
            .await
            .unwrap();
        assert_eq!(
            store.load().await.unwrap(),
            MigrationState::ReadWriteNoSequence
        );
    }
}
