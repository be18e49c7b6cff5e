//! Rebuilding a change's log-store history from its legacy rows.
//!
//! A rebuild is split in two:
//! - [`ChangeRebuilder::build_updates`] writes commits into object inserters
//!   and returns the ref updates that would publish them, without touching refs.
//! - [`ChangeRebuilder::execute`] records the new [`LogState`] on the legacy row
//!   with a compare-and-set against the state read with the bundle.
//!
//! Commits are derived only from row contents, so rebuilding an unchanged
//! change yields the same object ids and only no-op ref updates.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cutover_legacy::{
    AccountId, ChangeBundle, ChangeId, ChangeStatus, Comment, CommentStatus, LegacyStore,
    LogState,
};
use cutover_repo::{
    BatchRefUpdate, ChainedCommands, Commit, ObjectId, ObjectInserter, ProjectName,
    ReceiveCommand, RepositoryManager, execute_checked,
};
use tracing::debug;

use crate::RebuildError;
use crate::refs::{all_users, change_meta_ref, draft_ref, draft_refs_prefix, parse_draft_ref};

/// Ident used for commits with no account, such as automated messages.
const SERVER_IDENT: &str = "Cutover Server <noreply@cutover.invalid>";

fn account_ident(account: AccountId) -> String {
    format!("Account {0} <{0}@cutover.invalid>", account.0)
}

/// One change's legacy rows, read for a single rebuild attempt.
#[derive(Debug, Clone)]
pub struct RebuildUnit {
    pub bundle: ChangeBundle,
}

impl RebuildUnit {
    pub fn new(bundle: ChangeBundle) -> Self {
        Self { bundle }
    }

    pub fn id(&self) -> ChangeId {
        self.bundle.id()
    }

    pub fn project(&self) -> &ProjectName {
        self.bundle.project()
    }
}

/// Where a rebuild writes objects and reads current ref values from.
pub struct RebuildTarget<'a> {
    pub change_ins: &'a ObjectInserter,
    pub change_cmds: &'a ChainedCommands,
    pub all_users_ins: &'a ObjectInserter,
    pub all_users_cmds: &'a ChainedCommands,
}

/// Output of [`ChangeRebuilder::build_updates`].
#[derive(Debug, Clone)]
pub struct StagedChange {
    pub id: ChangeId,
    /// Log state the bundle was read with.
    pub expected_state: Option<LogState>,
    pub new_state: LogState,
    /// Updates to the change's project repository.
    pub change_commands: Vec<ReceiveCommand>,
    /// Updates to `All-Users`.
    pub all_users_commands: Vec<ReceiveCommand>,
}

impl StagedChange {
    /// Commands that actually move a ref.
    pub fn effective_commands(&self) -> impl Iterator<Item = &ReceiveCommand> {
        self.change_commands
            .iter()
            .chain(&self.all_users_commands)
            .filter(|c| !c.is_noop())
    }

    /// Whether the log store already matches the legacy rows.
    pub fn is_noop(&self) -> bool {
        self.effective_commands().next().is_none()
    }
}

/// A commit to be written on the meta ref.
struct Entry {
    when: DateTime<Utc>,
    /// Tie-breaker for entries with the same timestamp.
    order: (u8, String),
    author: String,
    message: String,
}

/// Turns legacy rows into log-store commits.
#[derive(Debug, Default)]
pub struct ChangeRebuilder;

impl ChangeRebuilder {
    pub fn new() -> Self {
        Self
    }

    /// Stage the commits for one change and compute its ref updates.
    ///
    /// Objects go into the target inserters; refs are not updated. Returned
    /// commands may include no-ops, which callers must drop before adding
    /// them to a command set.
    pub async fn build_updates(
        &self,
        unit: &RebuildUnit,
        target: &RebuildTarget<'_>,
        allow_read_only: bool,
    ) -> Result<StagedChange, RebuildError> {
        let id = unit.id();
        let change = &unit.bundle.change;
        if let Some(state) = &change.log_state {
            if state.is_log_primary() {
                return Err(RebuildError::LogPrimary(id));
            }
            if !allow_read_only && state.is_read_only(Utc::now()) {
                return Err(RebuildError::ReadOnly(id));
            }
        }
        if unit.bundle.patch_sets.is_empty() {
            return Err(RebuildError::NoPatchSets(id));
        }

        let mut tip: Option<ObjectId> = None;
        for entry in meta_entries(&unit.bundle) {
            let commit = Commit {
                parents: tip.into_iter().collect(),
                author: entry.author,
                when: entry.when,
                message: entry.message,
            };
            tip = Some(target.change_ins.insert(commit.to_object()?).await?);
        }
        // Non-empty patch sets always produce at least one commit.
        let meta_tip = tip.ok_or(RebuildError::NoPatchSets(id))?;

        let meta_ref = change_meta_ref(id);
        let old_meta = target.change_cmds.current(&meta_ref).await?;
        let change_commands = vec![ReceiveCommand::new(
            meta_ref,
            ObjectId::or_zero(old_meta),
            meta_tip,
        )];

        let mut draft_tips = BTreeMap::new();
        for (account, comments) in drafts_by_account(&unit.bundle) {
            let commit = draft_commit(id, account, &comments);
            draft_tips.insert(account, target.all_users_ins.insert(commit.to_object()?).await?);
        }

        let prefix = draft_refs_prefix(id);
        let mut accounts: BTreeSet<AccountId> = draft_tips.keys().copied().collect();
        for ref_name in target.all_users_cmds.repo().refs_by_prefix(&prefix).await?.keys() {
            if let Some(account) = parse_draft_ref(id, ref_name) {
                accounts.insert(account);
            }
        }
        let mut all_users_commands = Vec::new();
        for account in accounts {
            let ref_name = draft_ref(id, account);
            let old = target.all_users_cmds.current(&ref_name).await?;
            let new = draft_tips.get(&account).copied();
            if old.is_none() && new.is_none() {
                continue;
            }
            all_users_commands.push(ReceiveCommand::new(
                ref_name,
                ObjectId::or_zero(old),
                ObjectId::or_zero(new),
            ));
        }

        let expected_state = change.log_state.clone();
        let read_only_until = expected_state.as_ref().and_then(|s| s.read_only_until);
        let new_state =
            LogState::legacy(Some(meta_tip), draft_tips).with_read_only_until(read_only_until);

        Ok(StagedChange {
            id,
            expected_state,
            new_state,
            change_commands,
            all_users_commands,
        })
    }

    /// Record the staged state on the legacy row.
    ///
    /// Fails with [`RebuildError::ConflictingUpdate`] if the row's log state
    /// changed since the bundle was read.
    pub async fn execute(
        &self,
        store: &dyn LegacyStore,
        staged: &StagedChange,
    ) -> Result<(), RebuildError> {
        let swapped = store
            .compare_and_set_log_state(
                staged.id,
                staged.expected_state.as_ref(),
                Some(&staged.new_state),
            )
            .await
            .map_err(|e| RebuildError::from_legacy(staged.id, e))?;
        if !swapped {
            return Err(RebuildError::ConflictingUpdate(staged.id));
        }
        Ok(())
    }

    /// Rebuild one change and publish its refs immediately.
    ///
    /// With `allow_read_only`, a change under a read-only lease is rebuilt and
    /// the lease is carried over into the new state.
    pub async fn rebuild_now(
        &self,
        store: &dyn LegacyStore,
        repos: &dyn RepositoryManager,
        id: ChangeId,
        allow_read_only: bool,
    ) -> Result<LogState, RebuildError> {
        let bundle = store
            .bundle(id)
            .await
            .map_err(|e| RebuildError::from_legacy(id, e))?;
        let unit = RebuildUnit::new(bundle);

        let change_repo = repos.open(unit.project()).await?;
        let all_users_repo = repos.open(&all_users()).await?;
        let change_ins = ObjectInserter::packed(Arc::clone(&change_repo));
        let all_users_ins = ObjectInserter::packed(Arc::clone(&all_users_repo));
        let mut change_cmds = ChainedCommands::new(change_repo);
        let mut all_users_cmds = ChainedCommands::new(all_users_repo);

        let staged = self
            .build_updates(
                &unit,
                &RebuildTarget {
                    change_ins: &change_ins,
                    change_cmds: &change_cmds,
                    all_users_ins: &all_users_ins,
                    all_users_cmds: &all_users_cmds,
                },
                allow_read_only,
            )
            .await?;
        self.execute(store, &staged).await?;

        for cmd in staged.change_commands.iter().filter(|c| !c.is_noop()) {
            change_cmds.add(cmd.clone())?;
        }
        for cmd in staged.all_users_commands.iter().filter(|c| !c.is_noop()) {
            all_users_cmds.add(cmd.clone())?;
        }
        publish(&change_ins, change_cmds).await?;
        publish(&all_users_ins, all_users_cmds).await?;

        debug!(change = %id, noop = staged.is_noop(), "rebuilt change");
        Ok(staged.new_state)
    }
}

/// Flush objects and apply the commands as one atomic batch.
async fn publish(ins: &ObjectInserter, cmds: ChainedCommands) -> Result<(), RebuildError> {
    if cmds.is_empty() {
        return Ok(());
    }
    ins.flush().await?;
    let repo = Arc::clone(cmds.repo());
    let update = BatchRefUpdate::new(cmds.into_commands())
        .with_allow_non_fast_forward(true)
        .with_reflog_message("Rebuild change in log store");
    execute_checked(repo.as_ref(), update).await?;
    Ok(())
}

fn meta_entries(bundle: &ChangeBundle) -> Vec<Entry> {
    let change = &bundle.change;
    let mut entries = Vec::new();

    let mut patch_sets: Vec<_> = bundle.patch_sets.iter().collect();
    patch_sets.sort_by_key(|ps| ps.id.number);
    for ps in patch_sets {
        let mut message = format!(
            "Create patch set {}\n\nPatch-set: {}\nCommit: {}\n",
            ps.id.number, ps.id.number, ps.revision
        );
        if ps.id.number == 1 {
            message.push_str(&format!("Subject: {}\n", change.subject));
            if let Some(topic) = &change.topic {
                message.push_str(&format!("Topic: {topic}\n"));
            }
        }
        entries.push(Entry {
            when: ps.created_on,
            order: (0, format!("{:010}", ps.id.number)),
            author: account_ident(ps.uploader),
            message,
        });
    }

    for approval in &bundle.approvals {
        entries.push(Entry {
            when: approval.granted,
            order: (
                1,
                format!(
                    "{:010}/{:010}/{}",
                    approval.patch_set.number, approval.account.0, approval.label
                ),
            ),
            author: account_ident(approval.account),
            message: format!(
                "Update patch set {}\n\nPatch-set: {}\nLabel: {}={:+}\n",
                approval.patch_set.number, approval.patch_set.number, approval.label, approval.value
            ),
        });
    }

    for msg in &bundle.messages {
        let mut message = match msg.patch_set {
            Some(ps) => format!(
                "Update patch set {}\n\n{}\n\nPatch-set: {}\n",
                ps.number, msg.message, ps.number
            ),
            None => format!("Update change\n\n{}\n", msg.message),
        };
        if msg.author.is_none() {
            message.push_str("Tag: autogenerated\n");
        }
        entries.push(Entry {
            when: msg.written_on,
            order: (2, msg.uuid.clone()),
            author: msg.author.map(account_ident).unwrap_or_else(|| SERVER_IDENT.to_string()),
            message,
        });
    }

    // Published comments are written in batches: one commit per author,
    // timestamp and patch set.
    let mut batches: BTreeMap<(DateTime<Utc>, AccountId, u32), Vec<&Comment>> = BTreeMap::new();
    for comment in bundle
        .comments
        .iter()
        .filter(|c| c.status == CommentStatus::Published)
    {
        batches
            .entry((comment.written_on, comment.author, comment.patch_set.number))
            .or_default()
            .push(comment);
    }
    for ((when, author, number), mut comments) in batches {
        comments.sort_by(|a, b| comment_key(a).cmp(&comment_key(b)));
        let mut message = format!("Update patch set {number}\n\nPatch-set: {number}\n");
        for c in &comments {
            message.push_str(&comment_line(c));
        }
        entries.push(Entry {
            when,
            order: (3, format!("{:010}/{:010}", author.0, number)),
            author: account_ident(author),
            message,
        });
    }

    if change.status != ChangeStatus::New {
        entries.push(Entry {
            when: change.last_updated_on,
            order: (4, String::new()),
            author: account_ident(change.owner),
            message: format!("Update change\n\nStatus: {}\n", change.status.as_str()),
        });
    }

    entries.sort_by(|a, b| (a.when, &a.order).cmp(&(b.when, &b.order)));
    entries
}

fn drafts_by_account(bundle: &ChangeBundle) -> BTreeMap<AccountId, Vec<&Comment>> {
    let mut drafts: BTreeMap<AccountId, Vec<&Comment>> = BTreeMap::new();
    for comment in bundle
        .comments
        .iter()
        .filter(|c| c.status == CommentStatus::Draft)
    {
        drafts.entry(comment.author).or_default().push(comment);
    }
    for comments in drafts.values_mut() {
        comments.sort_by(|a, b| comment_key(a).cmp(&comment_key(b)));
    }
    drafts
}

fn draft_commit(id: ChangeId, account: AccountId, comments: &[&Comment]) -> Commit {
    let when = comments
        .iter()
        .map(|c| c.written_on)
        .max()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let mut message = format!("Update draft comments\n\nChange: {id}\n");
    for c in comments {
        message.push_str(&comment_line(c));
    }
    Commit {
        parents: Vec::new(),
        author: account_ident(account),
        when,
        message,
    }
}

fn comment_key<'a>(c: &'a Comment) -> (u32, &'a str, Option<u32>, DateTime<Utc>, &'a str) {
    (c.patch_set.number, &c.file, c.line, c.written_on, &c.uuid)
}

fn comment_line(c: &Comment) -> String {
    let line = c.line.map(|l| l.to_string()).unwrap_or_else(|| "file".to_string());
    format!(
        "Comment: {} {}:{} {}\n  {}\n",
        c.patch_set.number,
        c.file,
        line,
        c.uuid,
        c.message.replace('\n', "\n  ")
    )
}
