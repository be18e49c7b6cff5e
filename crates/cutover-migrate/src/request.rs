//! Parameters of one migration run.

use std::collections::BTreeSet;
use std::time::Duration;

use cutover_legacy::ChangeId;
use cutover_repo::ProjectName;
use cutover_state::MigrationState;

use crate::{MigrationError, ProgressSink};

/// What a [`Migrator`](crate::Migrator) run should do.
///
/// Options left unset are read from the site config when the migrator is
/// created.
#[derive(Clone, Default)]
pub struct MigrationRequest {
    pub(crate) projects: BTreeSet<ProjectName>,
    pub(crate) changes: BTreeSet<ChangeId>,
    pub(crate) threads: usize,
    pub(crate) trial: Option<bool>,
    pub(crate) auto_migrate: Option<bool>,
    pub(crate) force_rebuild: bool,
    pub(crate) sequence_gap: Option<i64>,
    pub(crate) stop_at: Option<MigrationState>,
    pub(crate) lease_timeout: Option<Duration>,
    pub(crate) progress: ProgressSink,
}

impl MigrationRequest {
    pub fn builder() -> MigrationRequestBuilder {
        MigrationRequestBuilder::new()
    }

    pub fn projects(&self) -> &BTreeSet<ProjectName> {
        &self.projects
    }

    pub fn changes(&self) -> &BTreeSet<ChangeId> {
        &self.changes
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn force_rebuild(&self) -> bool {
        self.force_rebuild
    }

    pub fn stop_at(&self) -> Option<MigrationState> {
        self.stop_at
    }

    pub(crate) fn validate(&self) -> Result<(), MigrationError> {
        if !self.projects.is_empty() && !self.changes.is_empty() {
            return Err(MigrationError::Precondition(
                "Cannot set both changes and projects".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`MigrationRequest`].
#[derive(Default)]
pub struct MigrationRequestBuilder {
    request: MigrationRequest,
}

impl MigrationRequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only rebuild changes of these projects.
    #[must_use]
    pub fn projects(mut self, projects: impl IntoIterator<Item = ProjectName>) -> Self {
        self.request.projects.extend(projects);
        self
    }

    /// Only rebuild these changes.
    #[must_use]
    pub fn changes(mut self, changes: impl IntoIterator<Item = ChangeId>) -> Self {
        self.request.changes.extend(changes);
        self
    }

    /// Worker tasks to run at once. 0 or 1 runs everything sequentially on
    /// the caller's task.
    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.request.threads = threads;
        self
    }

    /// Stop once the log store is readable and writable, before it becomes
    /// primary for any change.
    #[must_use]
    pub fn trial(mut self, trial: bool) -> Self {
        self.request.trial = Some(trial);
        self
    }

    /// Whether the host should resume the migration on restart.
    #[must_use]
    pub fn auto_migrate(mut self, auto_migrate: bool) -> Self {
        self.request.auto_migrate = Some(auto_migrate);
        self
    }

    /// Rebuild all changes even if the state says it was already done.
    #[must_use]
    pub fn force_rebuild(mut self, force: bool) -> Self {
        self.request.force_rebuild = force;
        self
    }

    /// Gap between the legacy and log-store change id sequences. A negative
    /// value falls back to the configured gap.
    #[must_use]
    pub fn sequence_gap(mut self, gap: i64) -> Self {
        self.request.sequence_gap = (gap >= 0).then_some(gap);
        self
    }

    /// Return as soon as the migration reaches `state`.
    #[must_use]
    pub fn stop_at(mut self, state: MigrationState) -> Self {
        self.request.stop_at = Some(state);
        self
    }

    /// How long each change stays read-only while it is cut over.
    #[must_use]
    pub fn lease_timeout(mut self, timeout: Duration) -> Self {
        self.request.lease_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn progress(mut self, progress: ProgressSink) -> Self {
        self.request.progress = progress;
        self
    }

    pub fn build(self) -> Result<MigrationRequest, MigrationError> {
        self.request.validate()?;
        Ok(self.request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_projects_and_changes_are_exclusive() {
        let result = MigrationRequest::builder()
            .projects([ProjectName::new("p")])
            .changes([ChangeId(1)])
            .build();
        assert!(matches!(result, Err(MigrationError::Precondition(_))));
    }

    #[test]
    fn test_negative_gap_means_unset() {
        let request = MigrationRequest::builder().sequence_gap(-1).build().unwrap();
        assert_eq!(request.sequence_gap, None);
        let request = MigrationRequest::builder().sequence_gap(0).build().unwrap();
        assert_eq!(request.sequence_gap, Some(0));
    }

    #[test]
    fn test_defaults() {
        let request = MigrationRequest::builder().build().unwrap();
        assert!(request.projects().is_empty());
        assert!(request.changes().is_empty());
        assert_eq!(request.trial, None);
        assert!(!request.force_rebuild());
        assert_eq!(request.stop_at(), None);
    }
}
