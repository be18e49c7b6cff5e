//! Migration of changes from the legacy store to the log store.
//!
//! The [`Migrator`] drives a site through the [`MigrationState`] stages:
//! - turn on log-store writes
//! - rebuild every change into the log store ([`ChangeRebuilder`], run one
//!   task per project by the [`BatchExecutor`])
//! - switch change ids to the log-store sequence ([`SequenceAllocator`])
//! - cut every change over to log-store primary ([`PrimaryStorageMigrator`])
//!
//! Each stage is committed through the [`ConfigStateStore`] before the next
//! one starts, so an interrupted migration resumes where it stopped.
//!
//! [`MigrationState`]: cutover_state::MigrationState
//! [`ConfigStateStore`]: cutover_state::ConfigStateStore

mod error;
mod executor;
mod migrator;
mod primary;
mod progress;
mod rebuild;
mod rebuilder;
pub mod refs;
mod request;
mod sequence;

pub use error::{MigrationError, PrimaryStorageError, RebuildError};
pub use executor::{BatchExecutor, TaskContext};
pub use migrator::Migrator;
pub use primary::{DEFAULT_LEASE_TIMEOUT, PrimaryStorageMigrator};
pub use progress::{ProgressSink, ProgressTask};
pub use rebuild::ProjectRebuilder;
pub use rebuilder::{ChangeRebuilder, RebuildTarget, RebuildUnit, StagedChange};
pub use request::{MigrationRequest, MigrationRequestBuilder};
pub use sequence::SequenceAllocator;
