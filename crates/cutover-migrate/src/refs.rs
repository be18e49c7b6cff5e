//! Ref and repository naming for the log store.

use cutover_legacy::{AccountId, ChangeId};
use cutover_repo::ProjectName;

/// Repository holding site-wide refs such as sequences.
pub const ALL_PROJECTS: &str = "All-Projects";

/// Repository holding per-account refs such as draft comments.
pub const ALL_USERS: &str = "All-Users";

/// Name of the change id sequence under `refs/sequences/`.
pub const CHANGES_SEQUENCE: &str = "changes";

pub fn all_projects() -> ProjectName {
    ProjectName::new(ALL_PROJECTS)
}

pub fn all_users() -> ProjectName {
    ProjectName::new(ALL_USERS)
}

/// `NN/id`, where `NN` is the last two digits of the id.
fn shard(id: ChangeId) -> String {
    format!("{:02}/{}", id.0 % 100, id.0)
}

/// Ref holding a change's history in its project repository.
pub fn change_meta_ref(id: ChangeId) -> String {
    format!("refs/changes/{}/meta", shard(id))
}

/// Prefix of every draft ref of a change in `All-Users`.
pub fn draft_refs_prefix(id: ChangeId) -> String {
    format!("refs/draft-comments/{}/", shard(id))
}

/// Ref holding one account's drafts on a change in `All-Users`.
pub fn draft_ref(id: ChangeId, account: AccountId) -> String {
    format!("{}{}", draft_refs_prefix(id), account.0)
}

/// Account of a draft ref of change `id`, if `ref_name` is one.
pub fn parse_draft_ref(id: ChangeId, ref_name: &str) -> Option<AccountId> {
    ref_name
        .strip_prefix(&draft_refs_prefix(id))?
        .parse()
        .ok()
        .map(AccountId)
}
