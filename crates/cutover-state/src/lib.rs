//! Migration state and its durable store.
//!
//! The migration state is not stored as a single value: it is derived from the
//! `[log_db.changes]` flags of two layered TOML files, `site.toml` and the
//! `migration.toml` overlay. [`ConfigStateStore`] is the only component that
//! writes those flags, and every write is a compare-and-swap against the state
//! currently on disk.

mod config;
mod error;
mod state;
mod store;

pub use config::{ConfigEdit, LayeredConfig, SECTION};
pub use error::{BoxError, StateStoreError};
pub use state::{MigrationState, StateFlags};
pub use store::{
    BASE_CONFIG_FILE, ConfigStateStore, DEFAULT_INITIAL_SEQUENCE_GAP, OVERLAY_CONFIG_FILE,
    StateChangeListener,
};
