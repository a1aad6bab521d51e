//! Session management: versioning, locking and space reclamation.
//!
//! One writer and any number of readers share a database directory. The
//! writer is serialized by [`lock`], readers advertise what they read through
//! [`readlock`], the [`superblock`] names the committed session, and every
//! commit runs the retirement pass of [`chain`] to fuse obsolete sessions.
//! [`manager::SessionManager`] ties the pieces together.

pub mod autosave;
pub mod bat;
pub mod chain;
pub mod config;
pub mod exit;
pub mod identity;
pub mod lock;
pub mod log;
pub mod manager;
pub mod readlock;
pub mod record;
pub mod superblock;

pub use autosave::{Autosave, AutosaveAction, AutosaveState, AutosaveTimer};
pub use chain::{ChainEntry, SessionChain};
pub use config::{ConfigError, SessionConfig};
pub use exit::{ExitHooks, HostHook, RecoveryHook};
pub use identity::Identity;
pub use lock::{FileLockManager, LockManager, LockMode};
pub use log::{CommitLog, ExitKind};
pub use manager::{CommitReport, SessionManager, SessionManagerBuilder};
pub use readlock::{DirReadlockRegistry, ReadlockEntry, ReadlockRegistry, ReadlockScan};
pub use record::{DirSessionStore, MemSessionStore, SessionRecord, SessionStore};
pub use superblock::{Freshness, Superblock, SuperblockStore};
