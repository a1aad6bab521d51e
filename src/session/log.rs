use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::session::identity::{format_unix, unix_now, Identity};

/// Append-only, human readable milestone log.
///
/// Write failures are logged and swallowed: losing a log line must never
/// fail a commit.
pub struct CommitLog {
    path: PathBuf,
    file: Option<File>,
    prefix: String,
    closed: bool,
}

/// How the process ended, recorded as the last line it writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitKind {
    /// Orderly shutdown.
    Normal,
    /// Crash handler ran.
    Abnormal,
}

impl CommitLog {
    /// Opens `path` for appending.
    pub fn open(path: impl AsRef<Path>, identity: &Identity) -> Self {
        let path = path.as_ref().to_path_buf();
        let file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(file),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "commit_log.open_failed");
                None
            }
        };
        Self {
            path,
            file,
            prefix: identity.to_string(),
            closed: false,
        }
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one milestone line.
    pub fn record(&mut self, event: &str) {
        if self.closed {
            return;
        }
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let line = format!("{} {} {}\n", format_unix(unix_now()), self.prefix, event);
        if let Err(err) = file.write_all(line.as_bytes()) {
            warn!(path = %self.path.display(), error = %err, "commit_log.write_failed");
        }
    }

    /// Flushes buffered lines to disk.
    pub fn flush(&mut self) {
        if let Some(file) = self.file.as_mut() {
            if let Err(err) = file.sync_data() {
                warn!(path = %self.path.display(), error = %err, "commit_log.flush_failed");
            }
        }
    }

    /// Writes the exit marker and closes the log; later calls are no-ops.
    pub fn close(&mut self, kind: ExitKind, detail: &str) {
        if self.closed {
            return;
        }
        let marker = match kind {
            ExitKind::Normal => "normal exit".to_string(),
            ExitKind::Abnormal => format!("abnormal exit: {detail}"),
        };
        self.record(&marker);
        self.flush();
        self.closed = true;
        self.file = None;
    }

    /// Returns `true` once an exit marker was written.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
