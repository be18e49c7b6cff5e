//! Per-change log-store state recorded on the legacy row.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use cutover_repo::ObjectId;
use serde::{Deserialize, Serialize};

use crate::AccountId;

/// Which store is authoritative for reads of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryStorage {
    #[default]
    Legacy,
    Log,
}

/// What the log store holds for a change, as last written by a rebuild.
///
/// While the legacy store is primary, `meta` and `drafts` are the ref tips a
/// rebuild produced; if the refs in the repositories no longer match, the
/// log store is stale. Once the log store is primary the tips are no longer
/// tracked here.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogState {
    pub primary: PrimaryStorage,
    /// Tip of the change's meta ref.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ObjectId>,
    /// Tip of each account's draft ref.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub drafts: BTreeMap<AccountId, ObjectId>,
    /// The change may not be written until this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only_until: Option<DateTime<Utc>>,
}

impl LogState {
    /// State of a change whose log store mirrors the legacy row.
    pub fn legacy(meta: Option<ObjectId>, drafts: BTreeMap<AccountId, ObjectId>) -> Self {
        Self {
            primary: PrimaryStorage::Legacy,
            meta,
            drafts,
            read_only_until: None,
        }
    }

    /// State of a change whose log store is authoritative.
    pub fn log_primary() -> Self {
        Self {
            primary: PrimaryStorage::Log,
            ..Self::default()
        }
    }

    pub fn is_log_primary(&self) -> bool {
        self.primary == PrimaryStorage::Log
    }

    /// Whether a read-only lease is still active at `now`.
    pub fn is_read_only(&self, now: DateTime<Utc>) -> bool {
        self.read_only_until.is_some_and(|until| now < until)
    }

    pub fn with_read_only_until(mut self, until: Option<DateTime<Utc>>) -> Self {
        self.read_only_until = until;
        self
    }

    /// Whether the recorded ref tips match the given ones.
    pub fn refs_match(
        &self,
        meta: Option<ObjectId>,
        drafts: &BTreeMap<AccountId, ObjectId>,
    ) -> bool {
        self.meta == meta && &self.drafts == drafts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use cutover_repo::RawObject;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_json_roundtrip_with_drafts() {
        let mut drafts = BTreeMap::new();
        drafts.insert(AccountId(7), RawObject::blob("d").id());
        let state = LogState::legacy(Some(RawObject::blob("m").id()), drafts);

        let json = serde_json::to_string(&state).unwrap();
        let back: LogState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_log_primary_serializes_compactly() {
        let json = serde_json::to_string(&LogState::log_primary()).unwrap();
        assert_eq!(json, r#"{"primary":"log"}"#);
    }

    #[test]
    fn test_read_only_lease() {
        let now = Utc::now();
        let state = LogState::default().with_read_only_until(Some(now + Duration::seconds(5)));
        assert!(state.is_read_only(now));
        assert!(!state.is_read_only(now + Duration::seconds(5)));
        assert!(!LogState::default().is_read_only(now));
    }
}
