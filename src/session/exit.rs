//! Crash and exit handling.
//!
//! Whatever ends the process, the write lock and the readlock marker must be
//! given back and the commit log must say how the process ended. The hooks
//! run at most once; a second crash while the first is being handled, or a
//! normal exit after a crash, is ignored.

use tracing::{error, info, warn};

use crate::session::lock::LockManager;
use crate::session::log::{CommitLog, ExitKind};
use crate::session::readlock::ReadlockRegistry;

/// Process resources the hooks clean up.
pub struct Resources<'a> {
    /// Write lock.
    pub lock: &'a mut dyn LockManager,
    /// This process's readlock.
    pub readlocks: &'a mut dyn ReadlockRegistry,
    /// Commit log.
    pub log: &'a mut CommitLog,
}

/// Best-effort cleanup run first when the process crashes.
pub trait RecoveryHook: Send {
    /// Releases what can be released; must not panic.
    fn recover(&mut self, resources: &mut Resources<'_>, reason: &str);
}

/// Default recovery: release the write lock, drop the readlock, flush the log.
#[derive(Debug, Default)]
pub struct DefaultRecovery;

impl RecoveryHook for DefaultRecovery {
    fn recover(&mut self, resources: &mut Resources<'_>, _reason: &str) {
        release_all(resources);
        resources.log.flush();
    }
}

/// Notification for the program embedding the engine, run last.
pub trait HostHook: Send {
    /// Called once with the way the process is ending.
    fn on_exit(&mut self, kind: ExitKind, reason: &str);
}

impl<F> HostHook for F
where
    F: FnMut(ExitKind, &str) + Send,
{
    fn on_exit(&mut self, kind: ExitKind, reason: &str) {
        self(kind, reason)
    }
}

fn release_all(resources: &mut Resources<'_>) {
    if resources.lock.is_held() {
        match resources.lock.release() {
            Ok(()) => resources.log.record("lock released"),
            Err(err) => warn!(error = %err, "exit.lock_release_failed"),
        }
    }
    resources.readlocks.unregister();
}

/// Runs the exit sequence once.
pub struct ExitHooks {
    recovery: Box<dyn RecoveryHook>,
    host: Option<Box<dyn HostHook>>,
    ran: Option<ExitKind>,
}

impl Default for ExitHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitHooks {
    /// Default recovery, no host hook.
    pub fn new() -> Self {
        Self {
            recovery: Box::new(DefaultRecovery),
            host: None,
            ran: None,
        }
    }

    /// Replaces the recovery hook.
    pub fn set_recovery(&mut self, hook: Box<dyn RecoveryHook>) {
        self.recovery = hook;
    }

    /// Installs the host hook.
    pub fn set_host(&mut self, hook: Box<dyn HostHook>) {
        self.host = Some(hook);
    }

    /// How the exit sequence ran, if it did.
    pub fn outcome(&self) -> Option<ExitKind> {
        self.ran
    }

    /// Fatal error path. Returns `false` when the sequence already ran.
    pub fn crash(&mut self, resources: &mut Resources<'_>, reason: &str) -> bool {
        if self.ran.is_some() {
            warn!(reason, "exit.crash.reentered");
            return false;
        }
        self.ran = Some(ExitKind::Abnormal);
        error!(reason, "exit.crash");
        self.recovery.recover(resources, reason);
        resources.log.close(ExitKind::Abnormal, reason);
        if let Some(host) = self.host.as_mut() {
            host.on_exit(ExitKind::Abnormal, reason);
        }
        true
    }

    /// Orderly shutdown. Returns `false` when the sequence already ran.
    pub fn normal_exit(&mut self, resources: &mut Resources<'_>) -> bool {
        if self.ran.is_some() {
            return false;
        }
        self.ran = Some(ExitKind::Normal);
        info!("exit.normal");
        release_all(resources);
        resources.log.close(ExitKind::Normal, "");
        if let Some(host) = self.host.as_mut() {
            host.on_exit(ExitKind::Normal, "");
        }
        true
    }
}
