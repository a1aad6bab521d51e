//! Database-wide write lock.
//!
//! The lock is a file in the database directory. With kernel locking the file
//! carries an exclusive advisory lock; in degraded mode the mere existence of
//! the file means "locked". Either way the file holds the holder's session
//! number and identity so a refused process can say who is in the way.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::primitives::concurrency::LockedFile;
use crate::primitives::io::remove_if_exists;
use crate::session::config::MAX_LOCK_WAIT;
use crate::session::identity::Identity;
use crate::types::{LineageError, LockHolder, Result, SessionId};

/// Exclusive write capability for a whole database.
pub trait LockManager: Send {
    /// Takes the lock, recording `(session, identity)` for diagnostics.
    fn acquire(&mut self, session: SessionId, identity: &Identity) -> Result<()>;
    /// Gives the lock up. Releasing a lock that is not held is a fatal
    /// programming error reported as [`LineageError::LockNotHeld`].
    fn release(&mut self) -> Result<()>;
    /// Returns `true` while this manager holds the lock.
    fn is_held(&self) -> bool;
    /// Reads who currently holds the lock, if anyone.
    fn holder(&self) -> Result<Option<LockHolder>>;
}

/// How "locked" is signalled on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// Kernel advisory lock on the lock file.
    Kernel,
    /// Exclusive creation of the lock file; for filesystems without reliable
    /// advisory locks.
    Existence,
}

enum Held {
    Kernel(LockedFile),
    Existence,
}

/// [`LockManager`] backed by a lock file.
pub struct FileLockManager {
    path: PathBuf,
    mode: LockMode,
    wait: Option<Duration>,
    held: Option<Held>,
}

const RETRY_PAUSE: Duration = Duration::from_millis(25);

impl FileLockManager {
    /// Creates a manager for the lock file at `path`; nothing is touched until
    /// [`LockManager::acquire`].
    pub fn new(path: impl Into<PathBuf>, mode: LockMode) -> Self {
        Self {
            path: path.into(),
            mode,
            wait: None,
            held: None,
        }
    }

    /// Lets `acquire` retry on contention for at most `wait` (capped at
    /// [`MAX_LOCK_WAIT`]).
    pub fn with_wait(mut self, wait: Option<Duration>) -> Self {
        self.wait = wait.map(|w| w.min(MAX_LOCK_WAIT));
        self
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_io(&self, source: std::io::Error) -> LineageError {
        LineageError::LockIo {
            path: self.path.clone(),
            source,
        }
    }

    fn try_once(&self, content: &[u8]) -> Result<Option<Held>> {
        match self.mode {
            LockMode::Kernel => {
                let Some(guard) = LockedFile::try_lock(&self.path).map_err(|e| self.lock_io(e))?
                else {
                    return Ok(None);
                };
                let mut file = guard.file();
                file.set_len(0).map_err(|e| self.lock_io(e))?;
                file.write_all(content).map_err(|e| self.lock_io(e))?;
                Ok(Some(Held::Kernel(guard)))
            }
            LockMode::Existence => {
                let mut opts = OpenOptions::new();
                opts.write(true).create_new(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::OpenOptionsExt;
                    opts.mode(0o666);
                }
                let mut file = match opts.open(&self.path) {
                    Ok(file) => file,
                    Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(None),
                    Err(err) => return Err(self.lock_io(err)),
                };
                if let Err(err) = file.write_all(content) {
                    let _ = fs::remove_file(&self.path);
                    return Err(self.lock_io(err));
                }
                Ok(Some(Held::Existence))
            }
        }
    }
}

impl LockManager for FileLockManager {
    fn acquire(&mut self, session: SessionId, identity: &Identity) -> Result<()> {
        if self.held.is_some() {
            return Err(LineageError::Invalid("write lock already held"));
        }
        let content = format!("{} {}\n", session.0, identity);
        let start = Instant::now();
        loop {
            if let Some(held) = self.try_once(content.as_bytes())? {
                self.held = Some(held);
                info!(path = %self.path.display(), session = session.0, "lock.acquire.ok");
                return Ok(());
            }
            let holder = self.holder()?.unwrap_or_else(unknown_holder);
            match self.wait {
                Some(wait) if start.elapsed() < wait => {
                    debug!(holder = %holder, "lock.acquire.waiting");
                    thread::sleep(RETRY_PAUSE);
                }
                _ => {
                    info!(holder = %holder, "lock.acquire.contended");
                    return Err(LineageError::LockHeld { holder });
                }
            }
        }
    }

    fn release(&mut self) -> Result<()> {
        let Some(held) = self.held.take() else {
            return Err(LineageError::LockNotHeld);
        };
        // Unlink while still locked: a process that opened the old file and
        // locks it after us sees the file is gone and retries.
        if let Err(err) = remove_if_exists(&self.path) {
            warn!(path = %self.path.display(), error = %err, "lock.release.unlink_failed");
        }
        if let Held::Kernel(guard) = held {
            guard.unlock().map_err(|e| self.lock_io(e))?;
        }
        info!(path = %self.path.display(), "lock.release.ok");
        Ok(())
    }

    fn is_held(&self) -> bool {
        self.held.is_some()
    }

    fn holder(&self) -> Result<Option<LockHolder>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.lock_io(err)),
        };
        if self.mode == LockMode::Kernel && self.held.is_none() {
            // The file outlives a crashed holder; only a live lock counts.
            match LockedFile::try_lock(&self.path) {
                Ok(Some(probe)) => {
                    drop(probe);
                    return Ok(None);
                }
                Ok(None) => {}
                Err(err) => return Err(self.lock_io(err)),
            }
        }
        Ok(Some(parse_holder(&text).unwrap_or_else(unknown_holder)))
    }
}

impl Drop for FileLockManager {
    fn drop(&mut self) {
        if self.held.is_some() {
            if let Err(err) = self.release() {
                warn!(error = %err, "lock.release.on_drop_failed");
            }
        }
    }
}

fn unknown_holder() -> LockHolder {
    LockHolder {
        session: SessionId(0),
        identity: "unknown".to_string(),
    }
}

fn parse_holder(text: &str) -> Option<LockHolder> {
    let line = text.lines().next()?.trim();
    let (session, identity) = line.split_once(' ')?;
    Some(LockHolder {
        session: SessionId(session.parse().ok()?),
        identity: identity.trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ann() -> Identity {
        Identity::new("ann", "alpha", 100)
    }

    fn bob() -> Identity {
        Identity::new("bob", "beta", 200)
    }

    #[test]
    fn second_acquire_reports_holder() {
        for mode in [LockMode::Kernel, LockMode::Existence] {
            let dir = tempdir().unwrap();
            let path = dir.path().join("lock");
            let mut a = FileLockManager::new(&path, mode);
            let mut b = FileLockManager::new(&path, mode);
            a.acquire(SessionId(5), &ann()).unwrap();
            let err = b.acquire(SessionId(5), &bob()).unwrap_err();
            match err {
                LineageError::LockHeld { holder } => {
                    assert_eq!(holder.identity, "ann@alpha:100");
                    assert_eq!(holder.session, SessionId(5));
                }
                other => panic!("unexpected error: {other:?}"),
            }
            a.release().unwrap();
            assert!(!path.exists());
            b.acquire(SessionId(6), &bob()).unwrap();
            assert_eq!(b.holder().unwrap().unwrap().identity, "bob@beta:200");
            b.release().unwrap();
        }
    }

    #[test]
    fn release_without_hold_is_fatal() {
        let dir = tempdir().unwrap();
        let mut lock = FileLockManager::new(dir.path().join("lock"), LockMode::Kernel);
        let err = lock.release().unwrap_err();
        assert!(matches!(err, LineageError::LockNotHeld));
        assert!(err.is_fatal());
    }

    #[test]
    fn stale_kernel_lock_file_is_not_a_holder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");
        fs::write(&path, "9 ghost@gone:1\n").unwrap();
        let mut lock = FileLockManager::new(&path, LockMode::Kernel);
        assert_eq!(lock.holder().unwrap(), None);
        lock.acquire(SessionId(10), &ann()).unwrap();
        lock.release().unwrap();
    }

    #[test]
    fn stale_existence_lock_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");
        fs::write(&path, "9 ghost@gone:1\n").unwrap();
        let mut lock = FileLockManager::new(&path, LockMode::Existence);
        let err = lock.acquire(SessionId(10), &ann()).unwrap_err();
        assert!(err.is_contention());
    }

    #[test]
    fn bounded_wait_gives_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");
        let mut a = FileLockManager::new(&path, LockMode::Kernel);
        a.acquire(SessionId(1), &ann()).unwrap();
        let mut b = FileLockManager::new(&path, LockMode::Kernel)
            .with_wait(Some(Duration::from_millis(80)));
        let start = Instant::now();
        assert!(b.acquire(SessionId(1), &bob()).unwrap_err().is_contention());
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn waiting_acquire_succeeds_after_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");
        let mut a = FileLockManager::new(&path, LockMode::Kernel);
        a.acquire(SessionId(1), &ann()).unwrap();
        let waiter_path = path.clone();
        let handle = thread::spawn(move || {
            let mut b = FileLockManager::new(waiter_path, LockMode::Kernel)
                .with_wait(Some(Duration::from_secs(5)));
            b.acquire(SessionId(2), &bob()).map(|_| b)
        });
        thread::sleep(Duration::from_millis(60));
        a.release().unwrap();
        let mut b = handle.join().unwrap().unwrap();
        assert!(b.is_held());
        b.release().unwrap();
    }
}
