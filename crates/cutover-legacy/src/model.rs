//! Legacy row model.

use std::fmt;

use chrono::{DateTime, Utc};
use cutover_repo::ProjectName;
use serde::{Deserialize, Serialize};

use crate::LogState;

/// Numeric change identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeId(pub u32);

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric account identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub u32);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A patch set within a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatchSetId {
    pub change: ChangeId,
    pub number: u32,
}

impl fmt::Display for PatchSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.change, self.number)
    }
}

/// Lifecycle status of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    New,
    Merged,
    Abandoned,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::New => "new",
            ChangeStatus::Merged => "merged",
            ChangeStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(ChangeStatus::New),
            "merged" => Some(ChangeStatus::Merged),
            "abandoned" => Some(ChangeStatus::Abandoned),
            _ => None,
        }
    }
}

/// A change row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub id: ChangeId,
    pub project: ProjectName,
    pub owner: AccountId,
    pub subject: String,
    pub topic: Option<String>,
    pub status: ChangeStatus,
    pub created_on: DateTime<Utc>,
    pub last_updated_on: DateTime<Utc>,
    /// Log-store mirror of this change; `None` until first rebuilt.
    pub log_state: Option<LogState>,
}

/// A patch set row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSet {
    pub id: PatchSetId,
    /// Commit the patch set points at.
    pub revision: String,
    pub uploader: AccountId,
    pub created_on: DateTime<Utc>,
}

/// A vote on a patch set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSetApproval {
    pub patch_set: PatchSetId,
    pub account: AccountId,
    pub label: String,
    pub value: i16,
    pub granted: DateTime<Utc>,
}

/// A change message row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMessage {
    pub uuid: String,
    pub author: Option<AccountId>,
    pub written_on: DateTime<Utc>,
    pub message: String,
    pub patch_set: Option<PatchSetId>,
}

/// Whether a comment is visible to others yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentStatus {
    Draft,
    Published,
}

/// An inline comment row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub uuid: String,
    pub patch_set: PatchSetId,
    pub author: AccountId,
    pub written_on: DateTime<Utc>,
    pub file: String,
    pub line: Option<u32>,
    pub message: String,
    pub status: CommentStatus,
}

/// Every row belonging to one change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeBundle {
    pub change: Change,
    pub patch_sets: Vec<PatchSet>,
    pub approvals: Vec<PatchSetApproval>,
    pub messages: Vec<ChangeMessage>,
    pub comments: Vec<Comment>,
}

impl ChangeBundle {
    /// A bundle with only the change row.
    pub fn new(change: Change) -> Self {
        Self {
            change,
            patch_sets: Vec::new(),
            approvals: Vec::new(),
            messages: Vec::new(),
            comments: Vec::new(),
        }
    }

    pub fn id(&self) -> ChangeId {
        self.change.id
    }

    pub fn project(&self) -> &ProjectName {
        &self.change.project
    }
}
