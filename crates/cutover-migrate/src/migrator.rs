//! The migration state machine.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use cutover_legacy::{ChangeId, LegacySource, LegacyStore};
use cutover_repo::{ProjectName, RepositoryManager};
use cutover_state::{ConfigStateStore, MigrationState, StateStoreError};
use tracing::{error, info, warn};

use crate::{
    BatchExecutor, MigrationError, MigrationRequest, PrimaryStorageError, PrimaryStorageMigrator,
    ProgressSink, ProjectRebuilder, SequenceAllocator, TaskContext,
};

/// Drives a site from the legacy store to the log store.
///
/// Every stage is committed through the [`ConfigStateStore`] before the next
/// one starts. Re-running [`migrate`](Self::migrate) after a crash resumes at
/// the last committed stage.
pub struct Migrator {
    store: Arc<ConfigStateStore>,
    repos: Arc<dyn RepositoryManager>,
    legacy: Arc<dyn LegacySource>,
    executor: BatchExecutor,
    primary: Arc<PrimaryStorageMigrator>,
    projects: BTreeSet<ProjectName>,
    changes: BTreeSet<ChangeId>,
    trial: bool,
    auto_migrate: bool,
    force_rebuild: bool,
    sequence_gap: i64,
    stop_at: Option<MigrationState>,
    progress: ProgressSink,
}

impl Migrator {
    /// Create a migrator, filling options the request leaves unset from the
    /// site config.
    pub async fn new(
        request: MigrationRequest,
        store: Arc<ConfigStateStore>,
        repos: Arc<dyn RepositoryManager>,
        legacy: Arc<dyn LegacySource>,
    ) -> Result<Self, MigrationError> {
        request.validate()?;
        let trial = match request.trial {
            Some(trial) => trial,
            None => store.trial().await?,
        };
        let auto_migrate = match request.auto_migrate {
            Some(auto_migrate) => auto_migrate,
            None => store.auto_migrate().await?,
        };
        let sequence_gap = match request.sequence_gap {
            Some(gap) => gap,
            None => store.initial_sequence_gap().await?,
        };
        if sequence_gap < 0 {
            return Err(MigrationError::Precondition(format!(
                "Sequence gap must be non-negative: {sequence_gap}"
            )));
        }

        let mut primary = PrimaryStorageMigrator::new(Arc::clone(&repos));
        if let Some(timeout) = request.lease_timeout {
            primary = primary.with_lease_timeout(timeout);
        }

        Ok(Self {
            store,
            repos,
            legacy,
            executor: BatchExecutor::new(request.threads),
            primary: Arc::new(primary),
            projects: request.projects,
            changes: request.changes,
            trial,
            auto_migrate,
            force_rebuild: request.force_rebuild,
            sequence_gap,
            stop_at: request.stop_at,
            progress: request.progress,
        })
    }

    /// Run the full migration from the current state.
    #[tracing::instrument(skip(self), fields(trial = self.trial, force = self.force_rebuild))]
    pub async fn migrate(&self) -> Result<(), MigrationError> {
        if !self.projects.is_empty() || !self.changes.is_empty() {
            return Err(MigrationError::Precondition(
                "Cannot set changes or projects during full migration; call rebuild() instead"
                    .to_string(),
            ));
        }

        let mut state = self.load_state().await?;
        if self.trial && state > MigrationState::ReadWriteNoSequence {
            return Err(MigrationError::Precondition(
                "Migration has already progressed past the endpoint of the \"trial mode\" state; \
                 the log store is already the primary storage for some changes"
                    .to_string(),
            ));
        }
        if self.force_rebuild && state > MigrationState::ReadWriteWithSequenceLegacyPrimary {
            return Err(MigrationError::Precondition(
                "Cannot force rebuild changes; the log store is already primary and \
                 authoritative for some changes"
                    .to_string(),
            ));
        }
        self.store
            .set_control_flags(self.auto_migrate, self.trial)
            .await?;

        let mut rebuilt = false;
        while state < MigrationState::LogPrimary {
            if Some(state) == self.stop_at {
                info!(%state, "stopping migration at requested state");
                return Ok(());
            }
            let still_needs_rebuild = self.force_rebuild && !rebuilt;
            if self.trial
                && state >= MigrationState::ReadWriteNoSequence
                && !(still_needs_rebuild && state == MigrationState::ReadWriteNoSequence)
            {
                info!(%state, "trial mode: log store is readable and writable; stopping");
                return Ok(());
            }

            state = match state {
                MigrationState::Legacy => self.turn_on_writes(state).await?,
                MigrationState::Write => {
                    let next = self.rebuild_and_enable_reads(state).await?;
                    rebuilt = true;
                    next
                }
                MigrationState::ReadWriteNoSequence if still_needs_rebuild => {
                    let next = self.rebuild_and_enable_reads(state).await?;
                    rebuilt = true;
                    next
                }
                MigrationState::ReadWriteNoSequence => self.enable_sequences(state).await?,
                MigrationState::ReadWriteWithSequenceLegacyPrimary if still_needs_rebuild => {
                    let next = self.rebuild_and_enable_reads(state).await?;
                    rebuilt = true;
                    next
                }
                MigrationState::ReadWriteWithSequenceLegacyPrimary
                | MigrationState::ReadWriteWithSequenceLogPrimary => {
                    self.set_log_primary(state).await?
                }
                MigrationState::LogPrimary => break,
            };
        }
        info!("migration to log store complete");
        Ok(())
    }

    /// Rebuild the requested changes without moving the migration state.
    #[tracing::instrument(skip(self))]
    pub async fn rebuild(&self) -> Result<(), MigrationError> {
        let state = match self.store.current().await {
            Some(state) => state,
            None => self.load_state().await?,
        };
        if !state.write() {
            return Err(MigrationError::Precondition(
                "Cannot rebuild without log_db.changes.write=true".to_string(),
            ));
        }
        self.rebuild_changes().await
    }

    /// Abort in-flight tasks. The migrator cannot be used afterwards.
    pub fn close(&self) {
        self.executor.close();
    }

    async fn load_state(&self) -> Result<MigrationState, MigrationError> {
        match self.store.load().await {
            Ok(state) => Ok(state),
            Err(StateStoreError::Unparseable(flags)) => {
                Err(MigrationError::UnsupportedState(flags))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn turn_on_writes(&self, prev: MigrationState) -> Result<MigrationState, MigrationError> {
        Ok(self
            .store
            .save(prev, MigrationState::Write, |_| {})
            .await?)
    }

    async fn rebuild_and_enable_reads(
        &self,
        prev: MigrationState,
    ) -> Result<MigrationState, MigrationError> {
        self.rebuild_changes().await?;
        // A forced rebuild at a later state leaves the state where it is.
        let target = prev.max(MigrationState::ReadWriteNoSequence);
        if target == prev {
            return Ok(prev);
        }
        Ok(self.store.save(prev, target, |_| {}).await?)
    }

    async fn enable_sequences(
        &self,
        prev: MigrationState,
    ) -> Result<MigrationState, MigrationError> {
        let legacy = self.legacy.open().await?;
        SequenceAllocator::new(Arc::clone(&self.repos))
            .reserve_gap(legacy.as_ref(), self.sequence_gap)
            .await?;
        Ok(self
            .store
            .save(prev, MigrationState::ReadWriteWithSequenceLegacyPrimary, |_| {})
            .await?)
    }

    async fn set_log_primary(
        &self,
        prev: MigrationState,
    ) -> Result<MigrationState, MigrationError> {
        let mut state = prev;
        if state != MigrationState::ReadWriteWithSequenceLogPrimary {
            state = self
                .store
                .save(state, MigrationState::ReadWriteWithSequenceLogPrimary, |_| {})
                .await?;
        }

        let ids = self.legacy.open().await?.all_change_ids().await?;
        let total = ids.len();
        let started = Instant::now();
        let progress = Arc::new(self.progress.begin_task("Migrating primary storage", total));

        let primary = Arc::clone(&self.primary);
        let task_progress = Arc::clone(&progress);
        let ok = self
            .executor
            .run_all(ids, Arc::clone(&self.legacy), move |id, ctx| {
                let primary = Arc::clone(&primary);
                let progress = Arc::clone(&task_progress);
                async move {
                    let ok = migrate_one(&primary, &ctx, id).await;
                    progress.update(1);
                    ok
                }
            })
            .await;
        progress.end();
        log_rate("migrated primary storage of", total, started);
        if !ok {
            return Err(MigrationError::PrimaryStorageFailed);
        }

        Ok(self
            .store
            .save(state, MigrationState::LogPrimary, |edit| {
                edit.set_auto_migrate(false)
            })
            .await?)
    }

    async fn rebuild_changes(&self) -> Result<(), MigrationError> {
        let legacy = self.legacy.open().await?;
        let groups = self.changes_by_project(legacy.as_ref()).await?;
        let total: usize = groups.values().map(BTreeSet::len).sum();
        info!(
            projects = groups.len(),
            changes = total,
            threads = self.executor.threads(),
            "rebuilding changes"
        );

        let progress = Arc::new(self.progress.begin_task("Rebuilding changes", total));
        let rebuilder = Arc::new(ProjectRebuilder::new(
            Arc::clone(&self.repos),
            Arc::clone(&progress),
        ));
        let started = Instant::now();
        let ok = self
            .executor
            .run_all(
                groups.into_iter().collect(),
                Arc::clone(&self.legacy),
                move |(project, changes): (ProjectName, BTreeSet<ChangeId>), ctx| {
                    let rebuilder = Arc::clone(&rebuilder);
                    async move { rebuilder.rebuild_project(&ctx, &project, &changes).await }
                },
            )
            .await;
        progress.end();
        log_rate("rebuilt", total, started);
        if !ok {
            return Err(MigrationError::RebuildFailed);
        }
        Ok(())
    }

    async fn changes_by_project(
        &self,
        legacy: &dyn LegacyStore,
    ) -> Result<BTreeMap<ProjectName, BTreeSet<ChangeId>>, MigrationError> {
        let mut groups: BTreeMap<ProjectName, BTreeSet<ChangeId>> = BTreeMap::new();
        if !self.projects.is_empty() {
            for project in &self.projects {
                let ids = legacy.change_ids_by_project(project).await?;
                if !ids.is_empty() {
                    groups.entry(project.clone()).or_default().extend(ids);
                }
            }
            return Ok(groups);
        }

        let changes = if self.changes.is_empty() {
            legacy.all_changes().await?
        } else {
            let ids: Vec<ChangeId> = self.changes.iter().copied().collect();
            let found = legacy.changes(&ids).await?;
            if found.len() < ids.len() {
                warn!(
                    requested = ids.len(),
                    found = found.len(),
                    "some requested changes do not exist"
                );
            }
            found
        };
        for change in changes {
            groups.entry(change.project).or_default().insert(change.id);
        }
        Ok(groups)
    }
}

async fn migrate_one(primary: &PrimaryStorageMigrator, ctx: &TaskContext, id: ChangeId) -> bool {
    let store = match ctx.legacy().await {
        Ok(store) => store,
        Err(e) => {
            error!(change = %id, error = %e, "failed to open legacy store");
            return false;
        }
    };
    match primary.migrate_to_log_primary(store.as_ref(), id).await {
        Ok(()) => true,
        Err(PrimaryStorageError::NoLogState(_)) => match store.patch_sets(id).await {
            Ok(patch_sets) if patch_sets.is_empty() => {
                warn!(
                    change = %id,
                    "change previously failed to rebuild; skipping primary storage migration"
                );
                true
            }
            Ok(_) => {
                error!(change = %id, "change was never rebuilt; cannot migrate primary storage");
                false
            }
            Err(e) => {
                error!(change = %id, error = %e, "failed to read patch sets");
                false
            }
        },
        Err(e) => {
            error!(change = %id, error = %e, "failed to migrate primary storage");
            false
        }
    }
}

fn log_rate(what: &str, count: usize, started: Instant) {
    let secs = started.elapsed().as_secs_f64();
    let rate = if secs > 0.0 { count as f64 / secs } else { 0.0 };
    info!("{what} {count} changes in {secs:.01} s ({rate:.01}/s)");
}
