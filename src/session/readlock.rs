//! Readlock registry.
//!
//! Every process that reads the database leaves a marker file naming the
//! session it started from. The writer consults the markers before retiring
//! sessions. Markers are advisory: a missing marker never blocks anyone, it
//! only risks retiring a session a slow reader still wanted. A marker can
//! also disappear between a scan and the retirement pass that uses it; that
//! window is accepted rather than closed with a heavier protocol.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::session::identity::{format_unix, parse_rfc3339, unix_now, Identity};
use crate::types::{LineageError, Result, SessionId};

/// Registry of reader markers protecting sessions from retirement.
pub trait ReadlockRegistry: Send {
    /// Creates this process's marker protecting `session`. Returns `false`
    /// when the marker could not be written; the process then runs
    /// unprotected.
    fn register(&mut self, session: SessionId) -> bool;
    /// Moves the marker to `session`, re-creating it if it vanished.
    fn renew(&mut self, session: SessionId) -> bool;
    /// Deletes the marker; safe to call repeatedly.
    fn unregister(&mut self);
    /// Lists markers, deleting those older than the timeout.
    fn scan(&mut self, now: SystemTime) -> Result<ReadlockScan>;
    /// Re-creates the marker if someone removed it and refreshes its age.
    fn self_check(&mut self) -> bool;
    /// Session currently protected by this process, if registered.
    fn protected_session(&self) -> Option<SessionId>;
}

/// One marker found in the registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReadlockEntry {
    /// Session the reader protects.
    pub session: u64,
    /// Host of the reader.
    pub host: String,
    /// Process id of the reader.
    pub pid: u32,
    /// Marker file name.
    pub file_name: String,
    /// Creation time from the marker content (unix seconds).
    pub created: Option<u64>,
    /// `user@host:pid` from the marker content.
    pub identity: Option<String>,
    /// Program that wrote the marker.
    pub program: Option<String>,
    /// Program version.
    pub version: Option<String>,
    /// Time since the marker was last written, in seconds.
    pub age_secs: u64,
}

/// Result of [`ReadlockRegistry::scan`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct ReadlockScan {
    /// Markers younger than the timeout.
    pub active: Vec<ReadlockEntry>,
    /// Markers older than the timeout; already deleted.
    pub expired: Vec<ReadlockEntry>,
}

impl ReadlockScan {
    /// Sessions that must not be retired.
    pub fn protected(&self) -> BTreeSet<SessionId> {
        self.active.iter().map(|e| SessionId(e.session)).collect()
    }

    /// Human readable "who is reading what".
    pub fn report(&self) -> String {
        let mut out = String::new();
        if self.active.is_empty() {
            out.push_str("no active readers\n");
        }
        for entry in &self.active {
            let _ = writeln!(
                out,
                "session {:>6}  {}  {} {}  since {}",
                entry.session,
                entry
                    .identity
                    .clone()
                    .unwrap_or_else(|| format!("?@{}:{}", entry.host, entry.pid)),
                entry.program.as_deref().unwrap_or("?"),
                entry.version.as_deref().unwrap_or("?"),
                entry
                    .created
                    .map(format_unix)
                    .unwrap_or_else(|| "unknown".to_string()),
            );
        }
        for entry in &self.expired {
            let _ = writeln!(
                out,
                "expired marker {} removed (idle {}h)",
                entry.file_name,
                entry.age_secs / 3600
            );
        }
        out
    }
}

/// Parses `<session>.<host>.<pid>`; host names may contain dots.
pub fn parse_marker_name(name: &str) -> Option<(SessionId, String, u32)> {
    let (session, rest) = name.split_once('.')?;
    let (host, pid) = rest.rsplit_once('.')?;
    if host.is_empty() || session.is_empty() || !session.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((SessionId(session.parse().ok()?), host.to_string(), pid.parse().ok()?))
}

/// Formats a marker file name.
pub fn marker_name(session: SessionId, identity: &Identity) -> String {
    format!("{}.{}.{}", session.0, identity.host, identity.pid)
}

/// [`ReadlockRegistry`] keeping one marker file per process in a shared
/// directory.
pub struct DirReadlockRegistry {
    dir: PathBuf,
    identity: Identity,
    timeout: Duration,
    own: Option<(SessionId, PathBuf)>,
}

impl DirReadlockRegistry {
    /// Creates a registry rooted at `dir`; the directory is created on first
    /// use.
    pub fn new(dir: impl Into<PathBuf>, identity: Identity, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            identity,
            timeout,
            own: None,
        }
    }

    /// Directory holding the markers.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ensure_dir(&self) -> std::io::Result<()> {
        if self.dir.is_dir() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(err) = fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o777)) {
                debug!(error = %err, "readlock.dir.chmod_failed");
            }
        }
        Ok(())
    }

    fn marker_body(&self) -> String {
        format!(
            "created={}\nidentity={}\nprogram={}\nversion={}\n",
            format_unix(unix_now()),
            self.identity,
            self.identity.program,
            self.identity.version
        )
    }

    fn write_marker(&self, path: &Path) -> std::io::Result<()> {
        self.ensure_dir()?;
        fs::write(path, self.marker_body())
    }

    fn is_own(&self, file_name: &str) -> bool {
        self.own
            .as_ref()
            .and_then(|(_, p)| p.file_name())
            .map(|n| n == file_name)
            .unwrap_or(false)
    }
}

impl ReadlockRegistry for DirReadlockRegistry {
    fn register(&mut self, session: SessionId) -> bool {
        if self.own.is_some() {
            return self.renew(session);
        }
        let path = self.dir.join(marker_name(session, &self.identity));
        match self.write_marker(&path) {
            Ok(()) => {
                debug!(session = session.0, path = %path.display(), "readlock.register");
                self.own = Some((session, path));
                true
            }
            Err(err) => {
                warn!(
                    session = session.0,
                    error = %err,
                    "readlock.register.failed"
                );
                false
            }
        }
    }

    fn renew(&mut self, session: SessionId) -> bool {
        let Some((old_session, old_path)) = self.own.take() else {
            return self.register(session);
        };
        if old_session == session && old_path.exists() {
            self.own = Some((old_session, old_path));
            return true;
        }
        let new_path = self.dir.join(marker_name(session, &self.identity));
        match fs::rename(&old_path, &new_path) {
            Ok(()) => {
                debug!(from = old_session.0, to = session.0, "readlock.renew");
                self.own = Some((session, new_path));
                true
            }
            Err(err) => {
                if err.kind() == ErrorKind::NotFound {
                    info!(session = session.0, "readlock.renew.vanished");
                } else {
                    warn!(error = %err, "readlock.renew.rename_failed");
                    let _ = fs::remove_file(&old_path);
                }
                self.register(session)
            }
        }
    }

    fn unregister(&mut self) {
        if let Some((session, path)) = self.own.take() {
            match fs::remove_file(&path) {
                Ok(()) => debug!(session = session.0, "readlock.unregister"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(error = %err, "readlock.unregister.failed"),
            }
        }
    }

    fn scan(&mut self, now: SystemTime) -> Result<ReadlockScan> {
        let mut scan = ReadlockScan::default();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(scan),
            Err(err) => return Err(LineageError::Io(err)),
        };
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some((session, host, pid)) = parse_marker_name(&file_name) else {
                debug!(name = %file_name, "readlock.scan.skip_malformed");
                continue;
            };
            let metadata = match entry.metadata() {
                Ok(meta) => meta,
                // Removed by its owner while we were listing.
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(LineageError::Io(err)),
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .unwrap_or_default();
            let mut record = ReadlockEntry {
                session: session.0,
                host,
                pid,
                file_name: file_name.clone(),
                created: None,
                identity: None,
                program: None,
                version: None,
                age_secs: age.as_secs(),
            };
            if let Ok(body) = fs::read_to_string(entry.path()) {
                for line in body.lines() {
                    match line.split_once('=') {
                        Some(("created", v)) => record.created = parse_rfc3339(v),
                        Some(("identity", v)) => record.identity = Some(v.to_string()),
                        Some(("program", v)) => record.program = Some(v.to_string()),
                        Some(("version", v)) => record.version = Some(v.to_string()),
                        _ => {}
                    }
                }
            }
            if age > self.timeout && !self.is_own(&file_name) {
                match fs::remove_file(entry.path()) {
                    Ok(()) => info!(name = %file_name, age_secs = age.as_secs(), "readlock.scan.expired"),
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => warn!(name = %file_name, error = %err, "readlock.scan.expire_failed"),
                }
                scan.expired.push(record);
            } else {
                scan.active.push(record);
            }
        }
        scan.active.sort_by(|a, b| a.session.cmp(&b.session).then(a.pid.cmp(&b.pid)));
        Ok(scan)
    }

    fn self_check(&mut self) -> bool {
        let Some((session, path)) = self.own.clone() else {
            return false;
        };
        if !path.exists() {
            warn!(session = session.0, "readlock.self_check.recreate");
        }
        match self.write_marker(&path) {
            Ok(()) => true,
            Err(err) => {
                warn!(session = session.0, error = %err, "readlock.self_check.failed");
                false
            }
        }
    }

    fn protected_session(&self) -> Option<SessionId> {
        self.own.as_ref().map(|(session, _)| *session)
    }
}

impl Drop for DirReadlockRegistry {
    fn drop(&mut self) {
        self.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const HOUR: Duration = Duration::from_secs(3600);

    fn registry(dir: &Path, pid: u32) -> DirReadlockRegistry {
        DirReadlockRegistry::new(
            dir.join("readlocks"),
            Identity::new("ann", "lab.example.org", pid),
            8 * HOUR,
        )
    }

    fn markers(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir.join("readlocks"))
            .map(|rd| {
                rd.map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[test]
    fn marker_names_roundtrip_with_dotted_hosts() {
        let id = Identity::new("ann", "lab.example.org", 77);
        let name = marker_name(SessionId(12), &id);
        assert_eq!(name, "12.lab.example.org.77");
        assert_eq!(
            parse_marker_name(&name),
            Some((SessionId(12), "lab.example.org".to_string(), 77))
        );
        assert_eq!(parse_marker_name("junk"), None);
        assert_eq!(parse_marker_name("12.host"), None);
        assert_eq!(parse_marker_name("x1.host.3"), None);
    }

    #[test]
    fn register_then_unregister_leaves_nothing() {
        let dir = tempdir().unwrap();
        let mut reg = registry(dir.path(), 10);
        assert!(reg.register(SessionId(4)));
        assert_eq!(markers(dir.path()), vec!["4.lab.example.org.10"]);
        reg.unregister();
        reg.unregister();
        assert!(markers(dir.path()).is_empty());
        assert_eq!(reg.protected_session(), None);
    }

    #[test]
    fn renew_moves_and_recovers_marker() {
        let dir = tempdir().unwrap();
        let mut reg = registry(dir.path(), 10);
        reg.register(SessionId(4));
        assert!(reg.renew(SessionId(5)));
        assert_eq!(markers(dir.path()), vec!["5.lab.example.org.10"]);
        fs::remove_file(dir.path().join("readlocks/5.lab.example.org.10")).unwrap();
        assert!(reg.renew(SessionId(6)));
        assert_eq!(markers(dir.path()), vec!["6.lab.example.org.10"]);
    }

    #[test]
    fn scan_separates_expired_markers() {
        let dir = tempdir().unwrap();
        let mut mine = registry(dir.path(), 10);
        let mut other = registry(dir.path(), 11);
        mine.register(SessionId(7));
        other.register(SessionId(3));
        fs::write(dir.path().join("readlocks/README"), "not a marker").unwrap();

        let now = SystemTime::now();
        let scan = mine.scan(now).unwrap();
        assert_eq!(
            scan.protected().into_iter().collect::<Vec<_>>(),
            vec![SessionId(3), SessionId(7)]
        );
        assert!(scan.expired.is_empty());
        assert!(scan.report().contains("ann@lab.example.org:11"));

        let later = now + 9 * HOUR;
        let scan = mine.scan(later).unwrap();
        assert_eq!(
            scan.protected().into_iter().collect::<Vec<_>>(),
            vec![SessionId(7)],
            "own marker is never expired, the orphan is"
        );
        assert_eq!(scan.expired.len(), 1);
        assert_eq!(scan.expired[0].session, 3);
        assert!(!dir.path().join("readlocks/3.lab.example.org.11").exists());
        assert!(dir.path().join("readlocks/README").exists());
    }

    #[test]
    fn self_check_recreates_removed_marker() {
        let dir = tempdir().unwrap();
        let mut reg = registry(dir.path(), 10);
        assert!(!reg.self_check());
        reg.register(SessionId(2));
        fs::remove_dir_all(dir.path().join("readlocks")).unwrap();
        assert!(reg.self_check());
        assert_eq!(markers(dir.path()), vec!["2.lab.example.org.10"]);
    }

    #[test]
    fn unwritable_registry_is_soft_failure() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("readlocks");
        fs::write(&blocker, "a file where the directory should be").unwrap();
        let mut reg = registry(dir.path(), 10);
        assert!(!reg.register(SessionId(1)));
        assert_eq!(reg.protected_session(), None);
    }

    #[test]
    fn drop_unregisters() {
        let dir = tempdir().unwrap();
        {
            let mut reg = registry(dir.path(), 10);
            reg.register(SessionId(9));
        }
        assert!(markers(dir.path()).is_empty());
    }
}
