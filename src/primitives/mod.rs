//! Low-level primitives the session engine is built on.
//!
//! Positioned file I/O, the advisory file lock, and the block store.

/// Block store trait and the file and in-memory stores.
pub mod blocks;

/// Advisory file locking and host information.
pub mod concurrency;

/// Positioned block-file I/O and atomic file replacement.
pub mod io;
