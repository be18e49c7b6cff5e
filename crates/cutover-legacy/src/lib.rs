//! Legacy relational change store.
//!
//! This crate provides:
//! - The row model for changes, patch sets, approvals, messages and comments
//! - [`LogState`], the per-change column recording the log-store mirror
//! - [`LegacyStore`] / [`LegacySource`], the interface the migrator reads through
//! - An in-memory store for tests and a SQLite store for real sites

mod error;
mod memory;
mod model;
mod sqlite;
mod state;
mod store;

pub use error::LegacyError;
pub use memory::MemoryLegacyStore;
pub use model::{
    AccountId, Change, ChangeBundle, ChangeId, ChangeMessage, ChangeStatus, Comment,
    CommentStatus, PatchSet, PatchSetApproval, PatchSetId,
};
pub use sqlite::{SqliteLegacySource, SqliteLegacyStore};
pub use state::{LogState, PrimaryStorage};
pub use store::{LegacySource, LegacyStore};
