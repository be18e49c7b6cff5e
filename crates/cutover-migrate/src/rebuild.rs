//! Rebuilding all changes of one project in a single task.

use std::collections::BTreeSet;
use std::sync::Arc;

use cutover_legacy::{ChangeId, LegacyStore};
use cutover_repo::{
    BatchRefUpdate, ChainedCommands, ObjectInserter, ProjectName, RepoError, RepositoryManager,
    execute_checked,
};
use tokio::sync::OnceCell;
use tracing::{debug, error, warn};

use crate::refs::all_users;
use crate::{
    ChangeRebuilder, MigrationError, ProgressTask, RebuildError, RebuildTarget, RebuildUnit,
    TaskContext,
};

const REFLOG_MESSAGE: &str = "Migrate changes to log store";

/// Rebuilds every change of a project and publishes the refs in one batch
/// per repository.
///
/// Tasks for different projects run concurrently. They share one loose
/// inserter for `All-Users`, opened by the first task that needs it, but each
/// task keeps its own command set.
pub struct ProjectRebuilder {
    repos: Arc<dyn RepositoryManager>,
    rebuilder: ChangeRebuilder,
    all_users_ins: OnceCell<Arc<ObjectInserter>>,
    progress: Arc<ProgressTask>,
}

impl ProjectRebuilder {
    pub fn new(repos: Arc<dyn RepositoryManager>, progress: Arc<ProgressTask>) -> Self {
        Self {
            repos,
            rebuilder: ChangeRebuilder::new(),
            all_users_ins: OnceCell::new(),
            progress,
        }
    }

    async fn all_users_inserter(&self) -> Result<Arc<ObjectInserter>, RepoError> {
        let ins = self
            .all_users_ins
            .get_or_try_init(|| async {
                let repo = self.repos.open(&all_users()).await?;
                Ok::<_, RepoError>(Arc::new(ObjectInserter::loose(repo)))
            })
            .await?;
        Ok(Arc::clone(ins))
    }

    /// Rebuild `changes` of `project`. Returns `false` if any change failed
    /// for a reason other than a known-benign race.
    #[tracing::instrument(skip(self, ctx, changes), fields(changes = changes.len()))]
    pub async fn rebuild_project(
        &self,
        ctx: &TaskContext,
        project: &ProjectName,
        changes: &BTreeSet<ChangeId>,
    ) -> bool {
        match self.try_rebuild_project(ctx, project, changes).await {
            Ok(ok) => ok,
            Err(e) => {
                error!(project = %project, error = %e, "failed to rebuild project");
                false
            }
        }
    }

    async fn try_rebuild_project(
        &self,
        ctx: &TaskContext,
        project: &ProjectName,
        changes: &BTreeSet<ChangeId>,
    ) -> Result<bool, MigrationError> {
        let store = ctx.legacy().await?;
        let opened = match self.repos.open(project).await {
            Ok(repo) => self.all_users_inserter().await.map(|ins| (repo, ins)),
            Err(e) => Err(e),
        };
        let (change_repo, all_users_ins) = match opened {
            Ok(opened) => opened,
            Err(RepoError::RepositoryNotFound(name)) => {
                warn!(
                    project = %project,
                    repo = %name,
                    "repository not found; skipping {} changes",
                    changes.len()
                );
                self.progress.update(changes.len());
                return Ok(true);
            }
            Err(e) => return Err(e.into()),
        };

        let change_ins = ObjectInserter::packed(Arc::clone(&change_repo));
        let mut change_cmds = ChainedCommands::new(change_repo);
        let mut all_users_cmds = ChainedCommands::new(Arc::clone(all_users_ins.repo()));

        let mut ok = true;
        for &id in changes {
            let result = self
                .rebuild_change(
                    store.as_ref(),
                    id,
                    &change_ins,
                    &mut change_cmds,
                    &all_users_ins,
                    &mut all_users_cmds,
                )
                .await;
            match result {
                Ok(()) => {}
                Err(RebuildError::NoPatchSets(_)) => {
                    warn!(change = %id, "change has no patch sets; skipping");
                }
                Err(RebuildError::ConflictingUpdate(_)) => {
                    warn!(
                        change = %id,
                        "rebuilding detected a conflicting legacy update; \
                         will be auto-rebuilt at runtime"
                    );
                }
                Err(e) => {
                    error!(change = %id, error = %e, "failed to rebuild change");
                    ok = false;
                }
            }
            self.progress.update(1);
        }

        // Both repositories are saved even if the first one fails.
        let change_saved = save(project, &change_ins, change_cmds).await;
        let all_users_saved = save(&all_users(), &all_users_ins, all_users_cmds).await;
        Ok(ok && change_saved && all_users_saved)
    }

    async fn rebuild_change(
        &self,
        store: &dyn LegacyStore,
        id: ChangeId,
        change_ins: &ObjectInserter,
        change_cmds: &mut ChainedCommands,
        all_users_ins: &ObjectInserter,
        all_users_cmds: &mut ChainedCommands,
    ) -> Result<(), RebuildError> {
        let bundle = store
            .bundle(id)
            .await
            .map_err(|e| RebuildError::from_legacy(id, e))?;
        let unit = RebuildUnit::new(bundle);
        let staged = {
            let target = RebuildTarget {
                change_ins,
                change_cmds,
                all_users_ins,
                all_users_cmds,
            };
            self.rebuilder.build_updates(&unit, &target, false).await?
        };
        self.rebuilder.execute(store, &staged).await?;

        for cmd in staged.change_commands.into_iter().filter(|c| !c.is_noop()) {
            change_cmds.add(cmd)?;
        }
        for cmd in staged.all_users_commands.into_iter().filter(|c| !c.is_noop()) {
            all_users_cmds.add(cmd)?;
        }
        Ok(())
    }
}

/// Flush `ins` and apply `cmds`. Lock failures are tolerated.
async fn save(project: &ProjectName, ins: &ObjectInserter, cmds: ChainedCommands) -> bool {
    if cmds.is_empty() {
        return true;
    }
    if let Err(e) = ins.flush().await {
        error!(project = %project, error = %e, "failed to write objects");
        return false;
    }
    let count = cmds.len();
    let repo = Arc::clone(cmds.repo());
    let update = BatchRefUpdate::new(cmds.into_commands())
        .with_atomic(false)
        .with_allow_non_fast_forward(true)
        .with_reflog_message(REFLOG_MESSAGE);
    match execute_checked(repo.as_ref(), update).await {
        Ok(()) => {
            debug!(project = %project, refs = count, "updated refs");
            true
        }
        Err(RepoError::LockFailure { refs }) => {
            warn!(
                project = %project,
                refs = %refs.join(", "),
                "ref updates failed with lock failure; changes will be auto-rebuilt at runtime"
            );
            true
        }
        Err(e) => {
            error!(project = %project, error = %e, "failed to update refs");
            false
        }
    }
}
