//! Write lock and stale-superblock behaviour across database handles.
//!
//! Each handle gets its own identity so the tests model separate processes
//! sharing one directory.

#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use lineage::session::{
    Freshness, Identity, LockManager, ReadlockRegistry, ReadlockScan, SessionConfig,
};
use lineage::types::LockHolder;
use lineage::{LineageError, Result, SessionId, SessionManager};
use parking_lot::Mutex;
use tempfile::tempdir;

fn config() -> SessionConfig {
    SessionConfig {
        block_size: 512,
        sync_write: false,
        ..SessionConfig::default()
    }
}

fn handle(dir: &Path, pid: u32) -> SessionManager {
    SessionManager::builder(dir)
        .config(config())
        .identity(Identity::new("tester", "node", pid))
        .open()
        .expect("open database")
}

fn create(dir: &Path) {
    SessionManager::builder(dir)
        .config(config())
        .identity(Identity::new("tester", "node", 1))
        .create("shared")
        .expect("create database")
        .close()
        .expect("close");
}

#[test]
fn second_writer_is_refused_with_holder_details() {
    let dir = tempdir().unwrap();
    create(dir.path());
    let mut a = handle(dir.path(), 10);
    let mut b = handle(dir.path(), 20);

    assert_eq!(a.begin_write().unwrap(), SessionId(2));
    match b.begin_write() {
        Err(LineageError::LockHeld { holder }) => {
            assert_eq!(holder.session, SessionId(2));
            assert_eq!(holder.identity, "tester@node:10");
        }
        other => panic!("expected lock contention, got {other:?}"),
    }
    assert!(!b.is_writer());
    assert_eq!(
        b.lock_holder().unwrap().map(|h| h.identity),
        Some("tester@node:10".to_string())
    );

    a.end_write().unwrap();
    assert!(b.lock_holder().unwrap().is_none());
    assert_eq!(b.begin_write().unwrap(), SessionId(2));
}

#[test]
fn commit_by_another_process_makes_handle_stale() {
    let dir = tempdir().unwrap();
    create(dir.path());
    let mut a = handle(dir.path(), 10);
    let mut b = handle(dir.path(), 20);

    a.begin_write().unwrap();
    a.set_title("from a").unwrap();
    a.commit().unwrap();
    a.end_write().unwrap();

    assert_eq!(
        b.revalidate().unwrap(),
        Freshness::Stale {
            on_disk: SessionId(2)
        }
    );
    match b.begin_write() {
        Err(LineageError::StaleSuperblock { expected, on_disk }) => {
            assert_eq!(expected, SessionId(1));
            assert_eq!(on_disk, SessionId(2));
        }
        other => panic!("expected stale superblock, got {other:?}"),
    }
    assert!(b.lock_holder().unwrap().is_none(), "refused writer keeps no lock");

    assert_eq!(b.refresh().unwrap(), SessionId(2));
    assert_eq!(b.revalidate().unwrap(), Freshness::Current);
    assert_eq!(b.begin_write().unwrap(), SessionId(3));
    b.commit().unwrap();
}

#[test]
fn existence_mode_locks_without_kernel_support() {
    let dir = tempdir().unwrap();
    create(dir.path());
    let degraded = SessionConfig {
        suppress_kernel_lock: true,
        ..config()
    };
    let open = |pid| {
        SessionManager::builder(dir.path())
            .config(degraded.clone())
            .identity(Identity::new("tester", "node", pid))
            .open()
            .unwrap()
    };
    let mut a = open(30);
    let mut b = open(31);
    a.begin_write().unwrap();
    assert!(b.begin_write().unwrap_err().is_contention());
    a.end_write().unwrap();
    b.begin_write().unwrap();
}

#[derive(Clone, Default)]
struct SharedLock(Arc<Mutex<Option<LockHolder>>>);

struct MemLock {
    shared: SharedLock,
    held: bool,
}

impl LockManager for MemLock {
    fn acquire(&mut self, session: SessionId, identity: &Identity) -> Result<()> {
        let mut slot = self.shared.0.lock();
        if let Some(holder) = slot.as_ref() {
            return Err(LineageError::LockHeld {
                holder: holder.clone(),
            });
        }
        *slot = Some(LockHolder {
            session,
            identity: identity.to_string(),
        });
        self.held = true;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if !self.held {
            return Err(LineageError::LockNotHeld);
        }
        *self.shared.0.lock() = None;
        self.held = false;
        Ok(())
    }

    fn is_held(&self) -> bool {
        self.held
    }

    fn holder(&self) -> Result<Option<LockHolder>> {
        Ok(self.shared.0.lock().clone())
    }
}

#[derive(Default)]
struct NoReaders {
    session: Option<SessionId>,
}

impl ReadlockRegistry for NoReaders {
    fn register(&mut self, session: SessionId) -> bool {
        self.session = Some(session);
        true
    }

    fn renew(&mut self, session: SessionId) -> bool {
        self.register(session)
    }

    fn unregister(&mut self) {
        self.session = None;
    }

    fn scan(&mut self, _now: SystemTime) -> Result<ReadlockScan> {
        Ok(ReadlockScan::default())
    }

    fn self_check(&mut self) -> bool {
        self.session.is_some()
    }

    fn protected_session(&self) -> Option<SessionId> {
        self.session
    }
}

#[test]
fn substituted_backends_coordinate_handles() {
    let dir = tempdir().unwrap();
    create(dir.path());
    let shared = SharedLock::default();
    let open = |pid| {
        SessionManager::builder(dir.path())
            .config(config())
            .identity(Identity::new("tester", "node", pid))
            .lock_manager(Box::new(MemLock {
                shared: shared.clone(),
                held: false,
            }))
            .readlock_registry(Box::new(NoReaders::default()))
            .open()
            .unwrap()
    };
    let mut a = open(40);
    let mut b = open(41);

    a.begin_write().unwrap();
    assert!(b.begin_write().unwrap_err().is_contention());
    assert!(!dir.path().join("lock").exists(), "file lock is not used");

    a.commit().unwrap();
    a.close().unwrap();
    assert!(shared.0.lock().is_none(), "close releases the lock");

    b.refresh().unwrap();
    assert_eq!(b.begin_write().unwrap(), SessionId(3));
}
