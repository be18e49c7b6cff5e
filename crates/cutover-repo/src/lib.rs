//! Versioned object repository for the cutover log store.
//!
//! This crate provides:
//! - Content-addressed objects (blobs and commits) keyed by SHA-256
//! - Named refs with compare-and-swap batch updates
//! - Buffered ("packed") and immediate ("loose") object inserters
//! - Chained command sets that merge dependent updates to the same ref
//! - In-memory and filesystem repository managers
//! - A ref-backed sequence counter

mod batch;
mod commands;
mod error;
mod fs;
mod inserter;
mod memory;
mod object;
mod repository;
mod sequence;

pub use batch::{BatchRefUpdate, execute_checked};
pub use commands::{ChainedCommands, CommandResult, ReceiveCommand};
pub use error::RepoError;
pub use fs::FsRepositoryManager;
pub use inserter::{InsertMode, ObjectInserter};
pub use memory::{MemoryRepository, MemoryRepositoryManager};
pub use object::{Commit, ObjectId, ObjectKind, RawObject};
pub use repository::{ProjectName, Repository, RepositoryManager};
pub use sequence::RepoSequence;
