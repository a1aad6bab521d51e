//! Readlock markers: lifecycle, expiry and the protection they give readers
//! against retirement.

#![allow(missing_docs)]

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use lineage::session::{DirReadlockRegistry, Identity, ReadlockRegistry, SessionConfig};
use lineage::{SessionId, SessionManager};
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

fn markers(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir.join("readlocks"))
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

fn live_sessions(db: &SessionManager) -> Vec<u64> {
    db.chain()
        .unwrap()
        .entries()
        .into_iter()
        .filter(|e| e.live)
        .map(|e| e.number)
        .collect()
}

#[test]
fn marker_follows_the_session_a_reader_uses() {
    let dir = tempdir().unwrap();
    SessionManager::builder(dir.path())
        .config(config())
        .identity(Identity::new("tester", "node", 1))
        .create("readers")
        .unwrap()
        .close()
        .unwrap();

    let mut reader = handle(dir.path(), 20);
    assert_eq!(markers(dir.path()), vec!["1.node.20"]);

    let mut writer = handle(dir.path(), 10);
    writer.begin_write().unwrap();
    writer.commit().unwrap();
    assert_eq!(markers(dir.path()), vec!["1.node.20", "2.node.10"]);

    let scan = writer.readers().unwrap();
    let sessions: Vec<u64> = scan.active.iter().map(|e| e.session).collect();
    assert_eq!(sessions, vec![1, 2]);
    let entry = &scan.active[0];
    assert_eq!(entry.identity.as_deref(), Some("tester@node:20"));
    assert_eq!(entry.program.as_deref(), Some("lineage"));
    assert!(entry.created.is_some());
    assert!(scan.report().contains("tester@node:20"));

    assert_eq!(reader.refresh().unwrap(), SessionId(2));
    assert_eq!(markers(dir.path()), vec!["2.node.10", "2.node.20"]);

    reader.close().unwrap();
    writer.close().unwrap();
    assert!(markers(dir.path()).is_empty());
}

#[test]
fn orphaned_markers_expire_and_owners_recover() {
    let dir = tempdir().unwrap();
    let hour = Duration::from_secs(3600);
    let mut stale = DirReadlockRegistry::new(dir.path(), Identity::new("old", "node", 50), hour);
    let mut fresh = DirReadlockRegistry::new(dir.path(), Identity::new("new", "node", 51), hour);
    assert!(stale.register(SessionId(3)));
    assert!(fresh.register(SessionId(5)));
    fs::write(dir.path().join("not-a-marker"), b"junk").unwrap();

    let later = SystemTime::now() + 2 * hour;
    let scan = fresh.scan(later).unwrap();
    assert_eq!(scan.expired.len(), 1);
    assert_eq!(scan.expired[0].file_name, "3.node.50");
    assert_eq!(scan.active.len(), 1, "own marker never expires");
    assert!(!dir.path().join("3.node.50").exists());
    assert!(dir.path().join("not-a-marker").exists());

    assert!(stale.self_check(), "owner re-creates its marker");
    let scan = fresh.scan(SystemTime::now()).unwrap();
    assert_eq!(
        scan.protected().into_iter().collect::<Vec<_>>(),
        vec![SessionId(3), SessionId(5)]
    );

    stale.unregister();
    stale.unregister();
    assert_eq!(stale.protected_session(), None);
    assert_eq!(fresh.protected_session(), Some(SessionId(5)));
}

#[test]
fn reader_keeps_its_session_until_it_leaves() {
    let dir = tempdir().unwrap();
    let mut writer = SessionManager::builder(dir.path())
        .config(config())
        .identity(Identity::new("tester", "node", 10))
        .create("pinned")
        .unwrap();

    writer.begin_write().unwrap();
    let block = writer.allocate(1).unwrap().start;
    writer.write_block(block, &[7u8; 512]).unwrap();
    writer.commit().unwrap(); // 2
    writer.commit().unwrap(); // 3

    let mut reader = handle(dir.path(), 20);
    assert_eq!(reader.committed_session(), SessionId(3));

    writer.commit().unwrap(); // 4
    writer.free(lineage::BlockRange::new(block, 1)).unwrap();
    let mut last = None;
    for _ in 5..=8 {
        last = Some(writer.commit().unwrap());
    }
    let report = last.unwrap();
    assert_eq!(report.session, 8);
    assert_eq!(report.protected, vec![3]);
    assert_eq!(live_sessions(&writer), vec![1, 2, 3, 7, 8]);

    let mut buf = vec![0u8; 512];
    reader.read_block(block, &mut buf).unwrap();
    assert_eq!(buf, vec![7u8; 512], "protected data is untouched");

    reader.close().unwrap();
    let report = writer.commit().unwrap(); // 9
    assert_eq!(report.retired, vec![2, 3, 7]);
    assert_eq!(report.released_blocks, 1);
    assert!(report.protected.is_empty());
    assert_eq!(live_sessions(&writer), vec![1, 8, 9]);
}
