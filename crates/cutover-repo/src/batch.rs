//! Batch ref updates.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use crate::{CommandResult, ObjectId, ReceiveCommand, RepoError, Repository};

/// A set of ref updates submitted together.
#[derive(Debug, Clone)]
pub struct BatchRefUpdate {
    pub commands: Vec<ReceiveCommand>,
    /// Apply all commands or none.
    pub atomic: bool,
    /// Permit updates whose new value does not descend from the old value.
    pub allow_non_fast_forward: bool,
    /// Message recorded with the update.
    pub reflog_message: String,
}

impl BatchRefUpdate {
    pub fn new(commands: Vec<ReceiveCommand>) -> Self {
        Self {
            commands,
            atomic: true,
            allow_non_fast_forward: false,
            reflog_message: String::new(),
        }
    }

    pub fn with_atomic(mut self, atomic: bool) -> Self {
        self.atomic = atomic;
        self
    }

    pub fn with_allow_non_fast_forward(mut self, allow: bool) -> Self {
        self.allow_non_fast_forward = allow;
        self
    }

    pub fn with_reflog_message(mut self, message: impl Into<String>) -> Self {
        self.reflog_message = message.into();
        self
    }

    /// Refs whose command did not succeed.
    pub fn failed_refs(&self) -> Vec<String> {
        self.commands
            .iter()
            .filter(|c| c.result != CommandResult::Ok)
            .map(|c| c.ref_name.clone())
            .collect()
    }
}

/// Run a batch and convert any failed command into an error.
///
/// If every failure is a lock failure the error is [`RepoError::LockFailure`]
/// listing the affected refs; otherwise it is [`RepoError::BatchFailed`].
pub async fn execute_checked(
    repo: &dyn Repository,
    mut update: BatchRefUpdate,
) -> Result<(), RepoError> {
    if update.commands.is_empty() {
        return Ok(());
    }
    repo.apply_batch(&mut update).await?;

    let failures: Vec<&ReceiveCommand> = update
        .commands
        .iter()
        .filter(|c| c.result != CommandResult::Ok)
        .collect();
    if failures.is_empty() {
        return Ok(());
    }
    // Aborted commands are collateral of another failure in an atomic batch.
    let only_lock_failures = failures
        .iter()
        .all(|c| matches!(c.result, CommandResult::LockFailure | CommandResult::Aborted));
    if only_lock_failures {
        let mut refs: Vec<String> = failures
            .iter()
            .filter(|c| c.result == CommandResult::LockFailure)
            .map(|c| c.ref_name.clone())
            .collect();
        refs.sort();
        refs.dedup();
        return Err(RepoError::LockFailure { refs });
    }
    let detail = failures
        .iter()
        .map(|c| format!("{}: {:?}", c.ref_name, c.result))
        .collect::<Vec<_>>()
        .join(", ");
    Err(RepoError::BatchFailed(detail))
}

/// Object-level checks that need to read the repository.
///
/// Marks commands whose new object is missing, or that are not fast-forwards
/// when the batch requires them to be.
pub(crate) async fn check_objects(
    repo: &dyn Repository,
    update: &mut BatchRefUpdate,
) -> Result<(), RepoError> {
    let allow_nff = update.allow_non_fast_forward;
    for cmd in &mut update.commands {
        if cmd.new_id.is_zero() {
            continue;
        }
        if !repo.has_object(&cmd.new_id).await? {
            cmd.result = CommandResult::RejectedMissingObject;
            continue;
        }
        if !allow_nff && !cmd.old_id.is_zero() && !repo.is_ancestor(&cmd.old_id, &cmd.new_id).await?
        {
            cmd.result = CommandResult::RejectedNonFastForward;
        }
    }
    Ok(())
}

/// Apply the remaining commands to a ref table under the caller's lock.
///
/// `locked` holds refs currently locked by another writer. Returns whether the
/// table was modified.
pub(crate) fn apply_to_refs(
    refs: &mut BTreeMap<String, ObjectId>,
    update: &mut BatchRefUpdate,
    locked: &HashSet<String>,
) -> bool {
    for cmd in &mut update.commands {
        if cmd.result != CommandResult::NotAttempted {
            continue;
        }
        let current = ObjectId::or_zero(refs.get(&cmd.ref_name).copied());
        if locked.contains(&cmd.ref_name) || current != cmd.old_id {
            cmd.result = CommandResult::LockFailure;
        }
    }

    let any_failed = update
        .commands
        .iter()
        .any(|c| !matches!(c.result, CommandResult::NotAttempted));
    if update.atomic && any_failed {
        for cmd in &mut update.commands {
            if cmd.result == CommandResult::NotAttempted {
                cmd.result = CommandResult::Aborted;
            }
        }
        debug!(message = %update.reflog_message, "atomic batch aborted");
        return false;
    }

    let mut modified = false;
    for cmd in &mut update.commands {
        if cmd.result != CommandResult::NotAttempted {
            continue;
        }
        if cmd.new_id.is_zero() {
            refs.remove(&cmd.ref_name);
        } else {
            refs.insert(cmd.ref_name.clone(), cmd.new_id);
        }
        cmd.result = CommandResult::Ok;
        modified = true;
    }
    modified
}
