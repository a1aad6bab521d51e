//! Lineage: session versioning and space reclamation for a shared on-disk
//! database.
//!
//! Processes coordinate only through files in the database directory: a
//! write lock, a directory of readlock markers, the double-slot superblock
//! and one record per session. Open a database with
//! [`SessionManager::open`], take the write lock with
//! [`SessionManager::begin_write`] and publish work with
//! [`SessionManager::commit`].

#![warn(missing_docs)]

pub mod primitives;
pub mod session;
pub mod types;

pub use session::{CommitReport, SessionConfig, SessionManager};
pub use types::{BlockId, BlockRange, LineageError, Result, SessionId};
