#![allow(unsafe_code)]

use std::fs::{File, Metadata, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

/// Attempts before giving up on a lock file that keeps being replaced.
const RELINK_RETRIES: usize = 8;

/// An open lock file holding an exclusive advisory lock.
///
/// The lock belongs to the open file description, so two handles in one
/// process exclude each other just like two processes do. Dropping the guard
/// releases the lock.
pub struct LockedFile {
    file: File,
    path: PathBuf,
    held: bool,
}

impl LockedFile {
    /// Opens (creating if needed) `path` and tries to lock it without blocking.
    ///
    /// `Ok(None)` means another handle holds the lock. If the file is unlinked
    /// between open and lock (a previous holder cleaning up) the attempt is
    /// repeated, so a returned guard always locks the file now at `path`.
    pub fn try_lock(path: impl AsRef<Path>) -> io::Result<Option<Self>> {
        let path = path.as_ref();
        for _ in 0..RELINK_RETRIES {
            let file = open_lock_file(path)?;
            if !sys::try_exclusive(&file)? {
                return Ok(None);
            }
            let guard = LockedFile {
                file,
                path: path.to_path_buf(),
                held: true,
            };
            if guard.still_linked()? {
                return Ok(Some(guard));
            }
        }
        Err(io::Error::new(
            io::ErrorKind::Other,
            "lock file kept being replaced while locking",
        ))
    }

    /// The locked file, for writing the holder line.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Releases the lock and closes the file.
    pub fn unlock(mut self) -> io::Result<()> {
        self.held = false;
        sys::release(&self.file)
    }

    fn still_linked(&self) -> io::Result<bool> {
        match std::fs::metadata(&self.path) {
            Ok(on_disk) => Ok(same_inode(&self.file.metadata()?, &on_disk)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        if self.held {
            if let Err(err) = sys::release(&self.file) {
                warn!(path = %self.path.display(), error = %err, "lockfile.release.failed");
            }
        }
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true).create(true).truncate(false);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o666);
    }
    opts.open(path)
}

#[cfg(unix)]
fn same_inode(a: &Metadata, b: &Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

// No cheap inode identity here; a lock file cannot be unlinked while open anyway.
#[cfg(not(unix))]
fn same_inode(_a: &Metadata, _b: &Metadata) -> bool {
    true
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    fn flock(file: &File, op: libc::c_int) -> io::Result<()> {
        loop {
            if unsafe { libc::flock(file.as_raw_fd(), op) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }

    pub fn try_exclusive(file: &File) -> io::Result<bool> {
        match flock(file, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => Ok(true),
            Err(err) if err.raw_os_error() == Some(libc::EWOULDBLOCK) => Ok(false),
            Err(err) if err.raw_os_error() == Some(libc::EAGAIN) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn release(file: &File) -> io::Result<()> {
        flock(file, libc::LOCK_UN)
    }
}

#[cfg(windows)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::windows::io::AsRawHandle;

    use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    // Locks the first byte; every participant agrees on that range.
    pub fn try_exclusive(file: &File) -> io::Result<bool> {
        let handle = file.as_raw_handle() as isize;
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        let flags = LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY;
        if unsafe { LockFileEx(handle, flags, 0, 1, 0, &mut overlapped) } != 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
            Ok(false)
        } else {
            Err(err)
        }
    }

    pub fn release(file: &File) -> io::Result<()> {
        let handle = file.as_raw_handle() as isize;
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        if unsafe { UnlockFileEx(handle, 0, 1, 0, &mut overlapped) } != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod sys {
    use std::fs::File;
    use std::io;

    pub fn try_exclusive(_file: &File) -> io::Result<bool> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "kernel file locks unavailable; use existence locking",
        ))
    }

    pub fn release(_file: &File) -> io::Result<()> {
        Ok(())
    }
}

/// Host name as reported by the operating system, `localhost` if unknown.
pub fn host_name() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        let res = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
        if res == 0 {
            let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
            if end > 0 {
                return String::from_utf8_lossy(&buf[..end]).into_owned();
            }
        }
        "localhost".to_string()
    }
    #[cfg(not(unix))]
    {
        std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
    }
}
