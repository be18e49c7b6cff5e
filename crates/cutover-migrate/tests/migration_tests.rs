//! End-to-end migration scenarios over in-memory repositories and an
//! in-memory legacy store, with the state persisted in a temporary site dir.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use cutover_legacy::{
    AccountId, Change, ChangeBundle, ChangeId, ChangeStatus, Comment, CommentStatus,
    LegacySource, LogState, MemoryLegacyStore, PatchSet, PatchSetId,
};
use cutover_migrate::refs::{all_projects, all_users, change_meta_ref, draft_ref};
use cutover_migrate::{MigrationError, MigrationRequest, Migrator, PrimaryStorageMigrator};
use cutover_repo::{MemoryRepositoryManager, ProjectName, RepoSequence, RepositoryManager};
use cutover_state::{
    BoxError, ConfigStateStore, MigrationState, StateChangeListener, StateStoreError,
};

struct Site {
    dir: TempDir,
    store: Arc<ConfigStateStore>,
    repos: Arc<MemoryRepositoryManager>,
    legacy: MemoryLegacyStore,
}

impl Site {
    async fn new() -> Self {
        Self::with_listeners(vec![]).await
    }

    async fn with_listeners(listeners: Vec<Arc<dyn StateChangeListener>>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConfigStateStore::open(dir.path(), listeners).await.unwrap());
        let repos = Arc::new(MemoryRepositoryManager::new());
        for name in [all_projects(), all_users(), project("alpha"), project("beta")] {
            repos.create(&name).await.unwrap();
        }
        Self {
            dir,
            store,
            repos,
            legacy: MemoryLegacyStore::new(),
        }
    }

    async fn migrator(&self, request: MigrationRequest) -> Migrator {
        self.try_migrator(request).await.unwrap()
    }

    async fn try_migrator(&self, request: MigrationRequest) -> Result<Migrator, MigrationError> {
        let legacy: Arc<dyn LegacySource> = Arc::new(self.legacy.clone());
        Migrator::new(request, Arc::clone(&self.store), self.repos.clone(), legacy).await
    }

    async fn state(&self) -> MigrationState {
        self.store.load().await.unwrap()
    }

    async fn set_state(&self, state: MigrationState) {
        let current = self.state().await;
        self.store.save(current, state, |_| {}).await.unwrap();
    }

    fn meta(&self, project_name: &str, id: u32) -> Option<cutover_repo::ObjectId> {
        self.repos
            .get(&project(project_name))
            .unwrap()
            .all_refs()
            .get(&change_meta_ref(ChangeId(id)))
            .copied()
    }

    fn is_log_primary(&self, id: u32) -> bool {
        self.legacy
            .log_state(ChangeId(id))
            .is_some_and(|s| s.is_log_primary())
    }
}

fn project(name: &str) -> ProjectName {
    ProjectName::new(name)
}

fn ts(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 3, 14, 12, 0, 0).unwrap() + chrono::Duration::minutes(minutes)
}

fn change(id: u32, project_name: &str, patch_sets: u32) -> ChangeBundle {
    let change_id = ChangeId(id);
    let mut bundle = ChangeBundle::new(Change {
        id: change_id,
        project: project(project_name),
        owner: AccountId(100),
        subject: format!("Change {id}"),
        topic: None,
        status: ChangeStatus::New,
        created_on: ts(0),
        last_updated_on: ts(10),
        log_state: None,
    });
    for number in 1..=patch_sets {
        bundle.patch_sets.push(PatchSet {
            id: PatchSetId {
                change: change_id,
                number,
            },
            revision: format!("{id}-{number}"),
            uploader: AccountId(100),
            created_on: ts(i64::from(number)),
        });
    }
    bundle
}

fn with_draft(mut bundle: ChangeBundle, author: u32) -> ChangeBundle {
    let patch_set = bundle.patch_sets[0].id;
    bundle.comments.push(Comment {
        uuid: format!("draft-{author}"),
        patch_set,
        author: AccountId(author),
        written_on: ts(5),
        file: "src/lib.rs".to_string(),
        line: Some(1),
        message: "unfinished thought".to_string(),
        status: CommentStatus::Draft,
    });
    bundle
}

struct RejectTransition {
    to: MigrationState,
}

#[async_trait]
impl StateChangeListener for RejectTransition {
    fn name(&self) -> &str {
        "reject"
    }

    async fn before_state_change(
        &self,
        _old: MigrationState,
        new: MigrationState,
    ) -> Result<(), BoxError> {
        if new == self.to {
            return Err(format!("not ready for {new}").into());
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_fresh_migration_reaches_log_primary() {
    let site = Site::new().await;
    site.legacy.insert(change(1, "alpha", 2)).unwrap();
    site.legacy.insert(with_draft(change(2, "alpha", 1), 7)).unwrap();
    site.legacy.insert(change(3, "beta", 1)).unwrap();

    let migrator = site
        .migrator(
            MigrationRequest::builder()
                .sequence_gap(10)
                .auto_migrate(true)
                .build()
                .unwrap(),
        )
        .await;
    migrator.migrate().await.unwrap();

    assert_eq!(site.state().await, MigrationState::LogPrimary);
    for id in 1..=3 {
        assert!(site.is_log_primary(id), "change {id} is not log-primary");
    }
    assert!(site.meta("alpha", 1).is_some());
    assert!(site.meta("alpha", 2).is_some());
    assert!(site.meta("beta", 3).is_some());
    let users = site.repos.get(&all_users()).unwrap().all_refs();
    assert!(users.contains_key(&draft_ref(ChangeId(2), AccountId(7))));

    // Legacy next id was 4: seeded at 4 + 10 - 1 and advanced once.
    let sequence = RepoSequence::new(site.repos.clone(), all_projects(), "changes", 1);
    assert_eq!(sequence.read().await.unwrap(), Some(14));

    assert!(!site.store.auto_migrate().await.unwrap());
}

#[tokio::test]
async fn test_parallel_migration() {
    let site = Site::new().await;
    for id in 1..=12 {
        let project_name = if id % 2 == 0 { "alpha" } else { "beta" };
        site.legacy.insert(change(id, project_name, 1)).unwrap();
    }

    let migrator = site
        .migrator(MigrationRequest::builder().threads(4).build().unwrap())
        .await;
    migrator.migrate().await.unwrap();

    assert_eq!(site.state().await, MigrationState::LogPrimary);
    assert!((1..=12).all(|id| site.is_log_primary(id)));
    // Each task opens its own legacy handle.
    assert!(site.legacy.opens() > 2);
}

#[tokio::test]
async fn test_partial_rebuild_of_changes() {
    let site = Site::new().await;
    for id in 1..=3 {
        site.legacy.insert(change(id, "alpha", 1)).unwrap();
    }
    site.set_state(MigrationState::Write).await;

    let migrator = site
        .migrator(
            MigrationRequest::builder()
                .changes([ChangeId(1), ChangeId(2)])
                .build()
                .unwrap(),
        )
        .await;
    migrator.rebuild().await.unwrap();

    assert!(site.legacy.log_state(ChangeId(1)).is_some());
    assert!(site.legacy.log_state(ChangeId(2)).is_some());
    assert_eq!(site.legacy.log_state(ChangeId(3)), None);
    assert!(site.meta("alpha", 3).is_none());
    assert_eq!(site.state().await, MigrationState::Write);

    let err = migrator.migrate().await.unwrap_err();
    assert!(err.to_string().contains("call rebuild() instead"));
}

#[tokio::test]
async fn test_partial_rebuild_of_projects() {
    let site = Site::new().await;
    site.legacy.insert(change(1, "alpha", 1)).unwrap();
    site.legacy.insert(change(2, "beta", 1)).unwrap();
    site.set_state(MigrationState::Write).await;

    site.migrator(
        MigrationRequest::builder()
            .projects([project("beta")])
            .build()
            .unwrap(),
    )
    .await
    .rebuild()
    .await
    .unwrap();

    assert_eq!(site.legacy.log_state(ChangeId(1)), None);
    assert!(site.meta("beta", 2).is_some());
}

#[tokio::test]
async fn test_rebuild_requires_writes() {
    let site = Site::new().await;
    site.legacy.insert(change(1, "alpha", 1)).unwrap();
    let err = site
        .migrator(MigrationRequest::default())
        .await
        .rebuild()
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Precondition(_)));
    assert!(err.to_string().contains("write=true"));
}

#[tokio::test]
async fn test_rebuild_is_idempotent() {
    let site = Site::new().await;
    site.legacy.insert(with_draft(change(1, "alpha", 2), 7)).unwrap();
    site.set_state(MigrationState::Write).await;

    let migrator = site.migrator(MigrationRequest::default()).await;
    migrator.rebuild().await.unwrap();
    let alpha = site.repos.get(&project("alpha")).unwrap();
    let refs = alpha.all_refs();
    let objects = alpha.object_count();
    let writes = alpha.object_writes();
    let state = site.legacy.log_state(ChangeId(1));

    migrator.rebuild().await.unwrap();
    assert_eq!(alpha.all_refs(), refs);
    assert_eq!(alpha.object_count(), objects);
    // Nothing to publish, so the packed inserter is never flushed.
    assert_eq!(alpha.object_writes(), writes);
    assert_eq!(site.legacy.log_state(ChangeId(1)), state);
}

#[tokio::test]
async fn test_crash_recovery_reruns_cutover() {
    let site = Site::new().await;
    for id in 1..=3 {
        site.legacy.insert(change(id, "alpha", 1)).unwrap();
    }
    site.migrator(
        MigrationRequest::builder()
            .stop_at(MigrationState::ReadWriteWithSequenceLegacyPrimary)
            .build()
            .unwrap(),
    )
    .await
    .migrate()
    .await
    .unwrap();
    assert_eq!(
        site.state().await,
        MigrationState::ReadWriteWithSequenceLegacyPrimary
    );

    // A previous run announced log-primary and cut over one change, then died.
    site.set_state(MigrationState::ReadWriteWithSequenceLogPrimary)
        .await;
    PrimaryStorageMigrator::new(site.repos.clone())
        .migrate_to_log_primary(&site.legacy, ChangeId(2))
        .await
        .unwrap();
    let meta_before = site.meta("alpha", 2);

    site.migrator(MigrationRequest::default())
        .await
        .migrate()
        .await
        .unwrap();

    assert_eq!(site.state().await, MigrationState::LogPrimary);
    assert!((1..=3).all(|id| site.is_log_primary(id)));
    assert_eq!(site.meta("alpha", 2), meta_before);
}

#[tokio::test]
async fn test_trial_mode_stops_before_primary() {
    let site = Site::new().await;
    site.legacy.insert(change(1, "alpha", 1)).unwrap();

    site.migrator(MigrationRequest::builder().trial(true).build().unwrap())
        .await
        .migrate()
        .await
        .unwrap();
    assert_eq!(site.state().await, MigrationState::ReadWriteNoSequence);
    assert!(site.store.trial().await.unwrap());
    assert!(!site.is_log_primary(1));
    assert!(site.meta("alpha", 1).is_some());

    // Trial is read from the config when not requested.
    site.migrator(MigrationRequest::default())
        .await
        .migrate()
        .await
        .unwrap();
    assert_eq!(site.state().await, MigrationState::ReadWriteNoSequence);
}

#[tokio::test]
async fn test_trial_mode_with_forced_rebuild() {
    let site = Site::new().await;
    site.legacy.insert(change(1, "alpha", 1)).unwrap();
    site.set_state(MigrationState::ReadWriteNoSequence).await;

    site.migrator(
        MigrationRequest::builder()
            .trial(true)
            .force_rebuild(true)
            .build()
            .unwrap(),
    )
    .await
    .migrate()
    .await
    .unwrap();

    assert_eq!(site.state().await, MigrationState::ReadWriteNoSequence);
    assert!(site.meta("alpha", 1).is_some());
}

#[tokio::test]
async fn test_trial_and_force_rejected_past_their_endpoints() {
    let site = Site::new().await;
    site.set_state(MigrationState::ReadWriteWithSequenceLegacyPrimary)
        .await;
    let err = site
        .migrator(MigrationRequest::builder().trial(true).build().unwrap())
        .await
        .migrate()
        .await
        .unwrap_err();
    assert!(err.to_string().contains("trial mode"));

    site.set_state(MigrationState::ReadWriteWithSequenceLogPrimary)
        .await;
    let err = site
        .migrator(
            MigrationRequest::builder()
                .trial(false)
                .force_rebuild(true)
                .build()
                .unwrap(),
        )
        .await
        .migrate()
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Precondition(_)));
    assert_eq!(
        site.state().await,
        MigrationState::ReadWriteWithSequenceLogPrimary
    );
}

#[tokio::test]
async fn test_change_without_patch_sets_is_skipped() {
    let site = Site::new().await;
    site.legacy.insert(change(1, "alpha", 1)).unwrap();
    site.legacy.insert(change(2, "alpha", 0)).unwrap();

    site.migrator(MigrationRequest::default())
        .await
        .migrate()
        .await
        .unwrap();

    assert_eq!(site.state().await, MigrationState::LogPrimary);
    assert!(site.is_log_primary(1));
    assert_eq!(site.legacy.log_state(ChangeId(2)), None);
}

#[tokio::test]
async fn test_unrebuilt_change_with_patch_sets_fails_cutover() {
    let site = Site::new().await;
    site.legacy.insert(change(1, "alpha", 1)).unwrap();
    // Its repository is missing, so rebuild skips it with a warning.
    site.legacy.insert(change(2, "gone", 1)).unwrap();

    let err = site
        .migrator(MigrationRequest::default())
        .await
        .migrate()
        .await
        .unwrap_err();

    assert!(matches!(err, MigrationError::PrimaryStorageFailed));
    assert_eq!(
        err.to_string(),
        "Migrating primary storage for some changes failed, see log"
    );
    assert_eq!(
        site.state().await,
        MigrationState::ReadWriteWithSequenceLogPrimary
    );
    assert!(site.is_log_primary(1));
    assert_eq!(site.legacy.log_state(ChangeId(2)), None);
}

#[tokio::test]
async fn test_deleted_project_repository_is_skipped() {
    let site = Site::new().await;
    site.legacy.insert(change(1, "alpha", 1)).unwrap();
    site.legacy.insert(change(2, "beta", 1)).unwrap();
    site.set_state(MigrationState::Write).await;
    assert!(site.repos.remove(&project("beta")));

    let migrator = site.migrator(MigrationRequest::default()).await;
    migrator.rebuild().await.unwrap();
    assert!(site.meta("alpha", 1).is_some());
    assert!(site.legacy.log_state(ChangeId(1)).is_some());
    assert_eq!(site.legacy.log_state(ChangeId(2)), None);

    // Change 2 has a patch set, so cutover does not skip it.
    let err = migrator.migrate().await.unwrap_err();
    assert!(matches!(err, MigrationError::PrimaryStorageFailed));
    assert!(site.is_log_primary(1));
    assert!(!site.is_log_primary(2));
}

#[tokio::test]
async fn test_missing_all_users_repository_is_a_warning() {
    let site = Site::new().await;
    site.legacy.insert(with_draft(change(1, "alpha", 1), 7)).unwrap();
    site.set_state(MigrationState::Write).await;
    assert!(site.repos.remove(&all_users()));

    site.migrator(MigrationRequest::default())
        .await
        .rebuild()
        .await
        .unwrap();

    assert_eq!(site.legacy.log_state(ChangeId(1)), None);
    assert!(site.meta("alpha", 1).is_none());
    assert_eq!(site.state().await, MigrationState::Write);
}

#[tokio::test]
async fn test_listener_aborts_transition() {
    let listener = Arc::new(RejectTransition {
        to: MigrationState::ReadWriteNoSequence,
    });
    let site = Site::with_listeners(vec![listener]).await;
    site.legacy.insert(change(1, "alpha", 1)).unwrap();

    let err = site
        .migrator(MigrationRequest::default())
        .await
        .migrate()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        MigrationError::StateStore(StateStoreError::ListenerRejected { .. })
    ));
    assert_eq!(site.state().await, MigrationState::Write);
}

#[tokio::test]
async fn test_lock_contention_is_not_a_failure() {
    let site = Site::new().await;
    site.legacy.insert(change(1, "alpha", 1)).unwrap();
    site.legacy.insert(change(2, "alpha", 1)).unwrap();
    site.set_state(MigrationState::Write).await;

    let alpha = site.repos.get(&project("alpha")).unwrap();
    alpha.lock_ref(change_meta_ref(ChangeId(1)));

    let migrator = site.migrator(MigrationRequest::default()).await;
    migrator.rebuild().await.unwrap();
    assert!(site.meta("alpha", 1).is_none());
    assert!(site.meta("alpha", 2).is_some());

    // Once the lock is released the stale ref is repaired.
    alpha.unlock_ref(&change_meta_ref(ChangeId(1)));
    migrator.migrate().await.unwrap();
    assert!(site.meta("alpha", 1).is_some());
    assert!(site.is_log_primary(1));
}

#[tokio::test]
async fn test_conflicting_legacy_write_during_cutover_is_rebuilt() {
    let site = Site::new().await;
    site.legacy.insert(change(1, "alpha", 1)).unwrap();
    site.migrator(
        MigrationRequest::builder()
            .stop_at(MigrationState::ReadWriteWithSequenceLegacyPrimary)
            .build()
            .unwrap(),
    )
    .await
    .migrate()
    .await
    .unwrap();
    let meta_before = site.meta("alpha", 1);

    // A serving-path write after the rebuild, marking the log state stale.
    site.legacy
        .update(ChangeId(1), |b| {
            b.patch_sets.push(PatchSet {
                id: PatchSetId {
                    change: ChangeId(1),
                    number: 2,
                },
                revision: "1-2".to_string(),
                uploader: AccountId(100),
                created_on: ts(20),
            });
            b.change.log_state = Some(LogState::default());
        })
        .unwrap();

    site.migrator(MigrationRequest::default())
        .await
        .migrate()
        .await
        .unwrap();
    assert!(site.is_log_primary(1));
    assert_ne!(site.meta("alpha", 1), meta_before);
}

#[tokio::test]
async fn test_unsupported_state() {
    let site = Site::new().await;
    std::fs::write(
        site.dir.path().join("site.toml"),
        "[log_db.changes]\nread = true\n",
    )
    .unwrap();

    let err = site
        .migrator(MigrationRequest::default())
        .await
        .migrate()
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::UnsupportedState(_)));
}

#[tokio::test]
async fn test_negative_configured_gap_is_rejected() {
    let site = Site::new().await;
    std::fs::write(
        site.dir.path().join("site.toml"),
        "[log_db.changes]\ninitial_sequence_gap = -5\n",
    )
    .unwrap();
    let err = site
        .try_migrator(MigrationRequest::default())
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("non-negative"));
}

#[tokio::test]
async fn test_closed_migrator_fails_rebuild() {
    let site = Site::new().await;
    site.legacy.insert(change(1, "alpha", 1)).unwrap();
    site.set_state(MigrationState::Write).await;

    let migrator = site.migrator(MigrationRequest::default()).await;
    migrator.close();
    let err = migrator.rebuild().await.unwrap_err();
    assert!(matches!(err, MigrationError::RebuildFailed));
    assert_eq!(
        err.to_string(),
        "Rebuilding some changes failed, see log"
    );
}

#[tokio::test]
async fn test_stop_at_state() {
    let site = Site::new().await;
    site.legacy.insert(change(1, "alpha", 1)).unwrap();
    site.migrator(
        MigrationRequest::builder()
            .stop_at(MigrationState::Write)
            .lease_timeout(Duration::from_secs(5))
            .build()
            .unwrap(),
    )
    .await
    .migrate()
    .await
    .unwrap();
    assert_eq!(site.state().await, MigrationState::Write);
    assert_eq!(site.legacy.log_state(ChangeId(1)), None);
}
