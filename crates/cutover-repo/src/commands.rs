//! Ref update commands and chained command sets.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{ObjectId, RepoError, Repository};

/// Outcome of a single command within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandResult {
    /// Not yet executed.
    #[default]
    NotAttempted,
    /// Applied.
    Ok,
    /// Ref was locked, or its value did not match the expected old value.
    LockFailure,
    /// New object is missing from the object database.
    RejectedMissingObject,
    /// Update is not a fast-forward and the batch does not allow that.
    RejectedNonFastForward,
    /// Not applied because another command in an atomic batch failed.
    Aborted,
}

/// A single ref update: move `ref_name` from `old_id` to `new_id`.
///
/// A zero old id means "must not exist"; a zero new id means "delete".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveCommand {
    pub ref_name: String,
    pub old_id: ObjectId,
    pub new_id: ObjectId,
    pub result: CommandResult,
}

impl ReceiveCommand {
    pub fn new(ref_name: impl Into<String>, old_id: ObjectId, new_id: ObjectId) -> Self {
        Self {
            ref_name: ref_name.into(),
            old_id,
            new_id,
            result: CommandResult::NotAttempted,
        }
    }

    /// Whether the command would leave the ref unchanged.
    pub fn is_noop(&self) -> bool {
        self.old_id == self.new_id
    }
}

/// Command set for one repository that merges successive updates to the same ref.
///
/// Adding an update for a ref that already has a pending command chains the
/// two: the new command must start from the pending command's new value, and
/// the result moves the ref from the original old value to the latest new
/// value. Degenerate (no-op) commands are rejected.
pub struct ChainedCommands {
    repo: Arc<dyn Repository>,
    commands: BTreeMap<String, ReceiveCommand>,
}

impl ChainedCommands {
    /// Create an empty command set reading current values from `repo`.
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            repo,
            commands: BTreeMap::new(),
        }
    }

    /// Add a command, chaining it with any pending command for the same ref.
    pub fn add(&mut self, cmd: ReceiveCommand) -> Result<(), RepoError> {
        if cmd.is_noop() {
            return Err(RepoError::DegenerateCommand(cmd.ref_name));
        }
        match self.commands.remove(&cmd.ref_name) {
            None => {
                self.commands.insert(cmd.ref_name.clone(), cmd);
            }
            Some(pending) => {
                if pending.new_id != cmd.old_id {
                    let err = RepoError::ChainMismatch {
                        ref_name: cmd.ref_name.clone(),
                        expected: pending.new_id.to_string(),
                        actual: cmd.old_id.to_string(),
                    };
                    self.commands.insert(pending.ref_name.clone(), pending);
                    return Err(err);
                }
                let merged = ReceiveCommand::new(cmd.ref_name, pending.old_id, cmd.new_id);
                if !merged.is_noop() {
                    self.commands.insert(merged.ref_name.clone(), merged);
                }
            }
        }
        Ok(())
    }

    /// Current value of a ref, taking pending commands into account.
    pub async fn current(&self, ref_name: &str) -> Result<Option<ObjectId>, RepoError> {
        match self.commands.get(ref_name) {
            Some(cmd) => Ok(cmd.new_id.non_zero()),
            None => self.repo.exact_ref(ref_name).await,
        }
    }

    /// The repository these commands target.
    pub fn repo(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Pending commands, ordered by ref name.
    pub fn commands(&self) -> impl Iterator<Item = &ReceiveCommand> {
        self.commands.values()
    }

    /// Consume the set, returning its commands ordered by ref name.
    pub fn into_commands(self) -> Vec<ReceiveCommand> {
        self.commands.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryRepositoryManager, ProjectName, RawObject, RepositoryManager};

    async fn repo() -> Arc<dyn Repository> {
        let manager = MemoryRepositoryManager::new();
        manager.create(&ProjectName::new("p")).await.unwrap()
    }

    fn id(s: &str) -> ObjectId {
        RawObject::blob(s).id()
    }

    #[tokio::test]
    async fn test_rejects_noop() {
        let mut cmds = ChainedCommands::new(repo().await);
        let err = cmds
            .add(ReceiveCommand::new("refs/x", id("a"), id("a")))
            .unwrap_err();
        assert!(matches!(err, RepoError::DegenerateCommand(_)));
        assert!(cmds.is_empty());
    }

    #[tokio::test]
    async fn test_chains_dependent_updates() {
        let mut cmds = ChainedCommands::new(repo().await);
        cmds.add(ReceiveCommand::new("refs/x", ObjectId::ZERO, id("a")))
            .unwrap();
        cmds.add(ReceiveCommand::new("refs/x", id("a"), id("b")))
            .unwrap();

        let all = cmds.into_commands();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].old_id, ObjectId::ZERO);
        assert_eq!(all[0].new_id, id("b"));
    }

    #[tokio::test]
    async fn test_chain_mismatch_keeps_pending() {
        let mut cmds = ChainedCommands::new(repo().await);
        cmds.add(ReceiveCommand::new("refs/x", ObjectId::ZERO, id("a")))
            .unwrap();
        let err = cmds
            .add(ReceiveCommand::new("refs/x", id("z"), id("b")))
            .unwrap_err();
        assert!(matches!(err, RepoError::ChainMismatch { .. }));
        assert_eq!(cmds.current("refs/x").await.unwrap(), Some(id("a")));
    }

    #[tokio::test]
    async fn test_chain_back_to_start_drops_command() {
        let mut cmds = ChainedCommands::new(repo().await);
        cmds.add(ReceiveCommand::new("refs/x", id("a"), id("b")))
            .unwrap();
        cmds.add(ReceiveCommand::new("refs/x", id("b"), id("a")))
            .unwrap();
        assert!(cmds.is_empty());
    }

    #[tokio::test]
    async fn test_current_falls_back_to_repo() {
        let cmds = ChainedCommands::new(repo().await);
        assert_eq!(cmds.current("refs/missing").await.unwrap(), None);
    }
}
