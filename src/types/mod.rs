//! Shared identifiers and the crate-wide error type.

use std::fmt;
use std::path::PathBuf;

use crate::session::config::ConfigError;

pub mod checksum;

pub use checksum::tagged_crc32;

/// Number of a session; doubles as the database clock.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct SessionId(pub u64);

/// Address of a block inside the block store.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct BlockId(pub u64);

/// Contiguous run of blocks handed out by [`crate::primitives::blocks::BlockStore::allocate`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct BlockRange {
    /// First block of the run.
    pub start: BlockId,
    /// Number of blocks in the run.
    pub len: u32,
}

impl BlockRange {
    /// Builds a range of `len` blocks starting at `start`.
    pub fn new(start: BlockId, len: u32) -> Self {
        Self { start, len }
    }

    /// Returns the block following the last block of the range, saturating
    /// at the top of the address space. Use [`BlockRange::checked_end`] on
    /// ranges that did not come from a block store.
    pub fn end(&self) -> BlockId {
        BlockId(self.start.0.saturating_add(self.len as u64))
    }

    /// Like [`BlockRange::end`], but a range running past the last
    /// addressable block is rejected.
    pub fn checked_end(&self) -> Result<BlockId> {
        self.start
            .0
            .checked_add(self.len as u64)
            .map(BlockId)
            .ok_or(LineageError::Invalid("block range overflows the address space"))
    }

    /// Iterates over every block of the range.
    pub fn iter(&self) -> impl Iterator<Item = BlockId> + '_ {
        (self.start.0..self.end().0).map(BlockId)
    }
}

impl SessionId {
    /// Session created together with the database; always permanent.
    pub const FIRST: SessionId = SessionId(1);

    /// Returns the following session number.
    pub fn next(self) -> SessionId {
        SessionId(self.0 + 1)
    }

}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.0, self.end().0)
    }
}

/// Diagnostic content of a held write lock.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LockHolder {
    /// Session number the holder was writing when it took the lock.
    pub session: SessionId,
    /// `user@host:pid` of the holder, as written into the lock file.
    pub identity: String,
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (session {})", self.identity, self.session)
    }
}

/// Errors surfaced by the session engine.
#[derive(thiserror::Error, Debug)]
pub enum LineageError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk structure failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller passed an invalid argument or called in the wrong state.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Requested item does not exist.
    #[error("not found")]
    NotFound,
    /// Another process holds the write lock.
    #[error("database is locked by {holder}")]
    LockHeld {
        /// Holder as recorded in the lock file.
        holder: LockHolder,
    },
    /// The lock file could not be created, opened or locked.
    #[error("cannot lock {path}: {source}")]
    LockIo {
        /// Path of the lock file.
        path: PathBuf,
        /// Underlying failure.
        source: std::io::Error,
    },
    /// `release` was called without holding the write lock.
    #[error("write lock released while not held")]
    LockNotHeld,
    /// The superblock was written by an incompatible schema.
    #[error("schema version {found} does not match expected {expected}")]
    SchemaMismatch {
        /// Version found on disk.
        found: u32,
        /// Version this build understands.
        expected: u32,
    },
    /// Another process committed since this handle read the superblock.
    #[error("cannot save, session {on_disk} was committed after {expected}; re-run")]
    StaleSuperblock {
        /// Session this handle started from.
        expected: SessionId,
        /// Session currently on disk.
        on_disk: SessionId,
    },
    /// A write operation was attempted without holding the write lock.
    #[error("operation requires the write lock")]
    NotWriter,
    /// Fusion would break block accounting.
    #[error("fusion accounting violated: {0}")]
    FusionInvariant(String),
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl LineageError {
    /// Returns `true` for errors after which the process must not continue
    /// writing to the database.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LineageError::Corruption(_)
                | LineageError::SchemaMismatch { .. }
                | LineageError::LockNotHeld
                | LineageError::FusionInvariant(_)
        )
    }

    /// Returns `true` when the failure is write-lock contention.
    pub fn is_contention(&self) -> bool {
        matches!(self, LineageError::LockHeld { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LineageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_iterates_all_blocks() {
        let range = BlockRange::new(BlockId(4), 3);
        let blocks: Vec<u64> = range.iter().map(|b| b.0).collect();
        assert_eq!(blocks, vec![4, 5, 6]);
        assert_eq!(range.end(), BlockId(7));
        assert_eq!(range.to_string(), "[4, 7)");
    }

    #[test]
    fn range_past_the_last_block_is_rejected() {
        let wrapping = BlockRange::new(BlockId(u64::MAX), 2);
        assert!(matches!(wrapping.checked_end(), Err(LineageError::Invalid(_))));
        assert_eq!(wrapping.end(), BlockId(u64::MAX));
        assert_eq!(wrapping.iter().count(), 0);
        assert_eq!(BlockRange::new(BlockId(4), 3).checked_end().unwrap(), BlockId(7));
    }

    #[test]
    fn fatal_classification() {
        assert!(LineageError::FusionInvariant("x".into()).is_fatal());
        assert!(LineageError::LockNotHeld.is_fatal());
        let held = LineageError::LockHeld {
            holder: LockHolder {
                session: SessionId(3),
                identity: "ann@box:12".into(),
            },
        };
        assert!(!held.is_fatal());
        assert!(held.is_contention());
        assert_eq!(
            held.to_string(),
            "database is locked by ann@box:12 (session 3)"
        );
    }
}
