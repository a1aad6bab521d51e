//! Autosave scheduling.
//!
//! [`Autosave`] is a pure state machine driven by explicit instants, so it
//! can be tested without sleeping. [`AutosaveTimer`] is the helper thread
//! that turns "wake me in N seconds" into tick events the host polls; it
//! never touches the database itself.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

/// Scheduler state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AutosaveState {
    /// Autosave not configured.
    Unset,
    /// A save is running and autosave is not configured.
    SavingWhileUnset,
    /// A save is running and autosave is configured.
    SavingWhileSet,
    /// Nothing to save; no timer until the next modification.
    Dead,
    /// Modified, idle long enough; waiting for the save interval.
    Inactive,
    /// Modified and still being worked on.
    Active,
}

/// What the host must do after feeding an input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AutosaveAction {
    /// Run a commit now, then call [`Autosave::end_save`].
    pub commit: bool,
    /// Deliver the next tick after this delay; `None` disarms the timer.
    pub next_tick: Option<Duration>,
}

impl AutosaveAction {
    fn idle() -> Self {
        Self::default()
    }

    fn after(delay: Duration) -> Self {
        Self {
            commit: false,
            next_tick: Some(delay),
        }
    }
}

/// Autosave state machine.
#[derive(Clone, Debug)]
pub struct Autosave {
    state: AutosaveState,
    save_interval: Duration,
    idle_interval: Duration,
    last_save: Instant,
    last_activity: Instant,
    modified_while_saving: bool,
}

impl Autosave {
    /// Unconfigured machine.
    pub fn new(now: Instant) -> Self {
        Self {
            state: AutosaveState::Unset,
            save_interval: Duration::ZERO,
            idle_interval: Duration::ZERO,
            last_save: now,
            last_activity: now,
            modified_while_saving: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> AutosaveState {
        self.state
    }

    /// Configured `(save, idle)` intervals.
    pub fn intervals(&self) -> Option<(Duration, Duration)> {
        (!self.save_interval.is_zero()).then_some((self.save_interval, self.idle_interval))
    }

    fn saving(&self) -> bool {
        matches!(
            self.state,
            AutosaveState::SavingWhileSet | AutosaveState::SavingWhileUnset
        )
    }

    /// Sets the intervals; a zero `save_interval` disables autosave.
    /// Different intervals reset the machine.
    pub fn configure(&mut self, save_interval: Duration, idle_interval: Duration, now: Instant) -> AutosaveAction {
        if save_interval.is_zero() {
            self.save_interval = Duration::ZERO;
            self.idle_interval = Duration::ZERO;
            self.state = if self.saving() {
                AutosaveState::SavingWhileUnset
            } else {
                AutosaveState::Unset
            };
            debug!("autosave.configure.off");
            return AutosaveAction::idle();
        }
        if self.intervals() == Some((save_interval, idle_interval)) {
            return self.rearm(now);
        }
        self.save_interval = save_interval;
        self.idle_interval = idle_interval;
        self.last_save = now;
        self.last_activity = now;
        self.modified_while_saving = false;
        self.state = if self.saving() {
            AutosaveState::SavingWhileSet
        } else {
            AutosaveState::Dead
        };
        debug!(
            save_secs = save_interval.as_secs(),
            idle_secs = idle_interval.as_secs(),
            "autosave.configure.reset"
        );
        AutosaveAction::idle()
    }

    /// Timer request matching the current state without changing it.
    fn rearm(&self, now: Instant) -> AutosaveAction {
        match self.state {
            AutosaveState::Active => AutosaveAction::after(
                self.idle_interval
                    .saturating_sub(now.saturating_duration_since(self.last_activity)),
            ),
            AutosaveState::Inactive => AutosaveAction::after(
                self.save_interval
                    .saturating_sub(now.saturating_duration_since(self.last_save)),
            ),
            _ => AutosaveAction::idle(),
        }
    }

    /// The user is interacting; postpones the idle deadline.
    pub fn activity(&mut self, now: Instant) -> AutosaveAction {
        self.last_activity = now;
        if self.state == AutosaveState::Inactive {
            self.state = AutosaveState::Active;
        }
        self.rearm(now)
    }

    /// The database was modified.
    pub fn modification(&mut self, now: Instant) -> AutosaveAction {
        self.last_activity = now;
        match self.state {
            AutosaveState::Unset => AutosaveAction::idle(),
            AutosaveState::SavingWhileSet | AutosaveState::SavingWhileUnset => {
                self.modified_while_saving = true;
                AutosaveAction::idle()
            }
            AutosaveState::Dead | AutosaveState::Inactive | AutosaveState::Active => {
                if self.state != AutosaveState::Active {
                    trace!(from = ?self.state, "autosave.active");
                }
                self.state = AutosaveState::Active;
                self.rearm(now)
            }
        }
    }

    /// Timer expiry.
    pub fn tick(&mut self, now: Instant) -> AutosaveAction {
        if self.state == AutosaveState::Active {
            let idle = now.saturating_duration_since(self.last_activity);
            if idle < self.idle_interval {
                return AutosaveAction::after(self.idle_interval - idle);
            }
            self.state = AutosaveState::Inactive;
        }
        if self.state != AutosaveState::Inactive {
            return AutosaveAction::idle();
        }
        let since_save = now.saturating_duration_since(self.last_save);
        if since_save >= self.save_interval {
            debug!(since_save_secs = since_save.as_secs(), "autosave.tick.commit");
            self.state = AutosaveState::SavingWhileSet;
            self.modified_while_saving = false;
            return AutosaveAction {
                commit: true,
                next_tick: None,
            };
        }
        AutosaveAction::after(self.save_interval - since_save)
    }

    /// An explicit save is starting; ticks are ignored until it ends.
    pub fn begin_save(&mut self) {
        match self.state {
            AutosaveState::Unset => self.state = AutosaveState::SavingWhileUnset,
            AutosaveState::Dead | AutosaveState::Inactive | AutosaveState::Active => {
                self.modified_while_saving = false;
                self.state = AutosaveState::SavingWhileSet;
            }
            AutosaveState::SavingWhileSet | AutosaveState::SavingWhileUnset => {}
        }
    }

    /// A save finished. `saved` is `false` when the commit failed, in which
    /// case the changes are still pending.
    pub fn end_save(&mut self, now: Instant, saved: bool) -> AutosaveAction {
        match self.state {
            AutosaveState::SavingWhileUnset => {
                self.state = AutosaveState::Unset;
                AutosaveAction::idle()
            }
            AutosaveState::SavingWhileSet => {
                self.last_save = now;
                let pending = self.modified_while_saving || !saved;
                self.modified_while_saving = false;
                self.state = if pending {
                    AutosaveState::Active
                } else {
                    AutosaveState::Dead
                };
                self.rearm(now)
            }
            _ => self.rearm(now),
        }
    }
}

enum TimerControl {
    Arm(Duration),
    Disarm,
    Shutdown,
}

/// Helper thread delivering autosave ticks through a channel.
pub struct AutosaveTimer {
    control: Sender<TimerControl>,
    ticks: Receiver<Instant>,
    handle: Option<JoinHandle<()>>,
}

impl AutosaveTimer {
    /// Starts the timer thread, initially disarmed.
    pub fn spawn() -> std::io::Result<Self> {
        let (control, control_rx) = mpsc::channel();
        let (tick_tx, ticks) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("lineage-autosave".into())
            .spawn(move || timer_loop(control_rx, tick_tx))?;
        Ok(Self {
            control,
            ticks,
            handle: Some(handle),
        })
    }

    /// Applies the timer part of an [`AutosaveAction`].
    pub fn apply(&self, action: AutosaveAction) {
        let msg = match action.next_tick {
            Some(delay) => TimerControl::Arm(delay),
            None => TimerControl::Disarm,
        };
        if self.control.send(msg).is_err() {
            warn!("autosave.timer.gone");
        }
    }

    /// Returns a pending tick without blocking.
    pub fn try_tick(&self) -> Option<Instant> {
        self.ticks.try_recv().ok()
    }

    /// Waits up to `timeout` for a tick.
    pub fn wait_tick(&self, timeout: Duration) -> Option<Instant> {
        self.ticks.recv_timeout(timeout).ok()
    }
}

impl Drop for AutosaveTimer {
    fn drop(&mut self) {
        let _ = self.control.send(TimerControl::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn timer_loop(control: Receiver<TimerControl>, ticks: Sender<Instant>) {
    let mut deadline: Option<Instant> = None;
    loop {
        let msg = match deadline {
            Some(at) => control.recv_timeout(at.saturating_duration_since(Instant::now())),
            None => control.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match msg {
            Ok(TimerControl::Arm(delay)) => deadline = Some(Instant::now() + delay),
            Ok(TimerControl::Disarm) => deadline = None,
            Ok(TimerControl::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                deadline = None;
                if ticks.send(Instant::now()).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    fn configured(t0: Instant, save: u32, idle: u32) -> Autosave {
        let mut fsm = Autosave::new(t0);
        fsm.configure(save * SECOND, idle * SECOND, t0);
        fsm
    }

    #[test]
    fn save_interval_bounds_commit_time() {
        let t0 = Instant::now();
        let mut fsm = configured(t0, 300, 0);
        assert_eq!(fsm.state(), AutosaveState::Dead);
        fsm.modification(t0);
        assert_eq!(fsm.state(), AutosaveState::Active);

        let early = fsm.tick(t0 + 100 * SECOND);
        assert!(!early.commit);
        assert_eq!(early.next_tick, Some(200 * SECOND));

        let due = fsm.tick(t0 + 301 * SECOND);
        assert!(due.commit);
        assert!(!fsm.tick(t0 + 302 * SECOND).commit, "only one commit per expiry");

        fsm.end_save(t0 + 303 * SECOND, true);
        assert_eq!(fsm.state(), AutosaveState::Dead);
        assert!(!fsm.tick(t0 + 700 * SECOND).commit);
    }

    #[test]
    fn idle_interval_defers_commit_while_busy() {
        let t0 = Instant::now();
        let mut fsm = configured(t0, 60, 30);
        fsm.modification(t0);
        fsm.activity(t0 + 50 * SECOND);
        let busy = fsm.tick(t0 + 70 * SECOND);
        assert!(!busy.commit);
        assert_eq!(busy.next_tick, Some(10 * SECOND));
        assert_eq!(fsm.state(), AutosaveState::Active);
        let quiet = fsm.tick(t0 + 80 * SECOND);
        assert!(quiet.commit);
    }

    #[test]
    fn explicit_save_wins_and_resets_baseline() {
        let t0 = Instant::now();
        let mut fsm = configured(t0, 300, 0);
        fsm.modification(t0);
        fsm.begin_save();
        assert!(!fsm.tick(t0 + 400 * SECOND).commit, "ticks ignored while saving");
        fsm.modification(t0 + 401 * SECOND);
        fsm.end_save(t0 + 402 * SECOND, true);
        assert_eq!(fsm.state(), AutosaveState::Active);
        assert!(!fsm.tick(t0 + 500 * SECOND).commit);
        assert!(fsm.tick(t0 + 703 * SECOND).commit);
    }

    #[test]
    fn failed_save_keeps_work_pending() {
        let t0 = Instant::now();
        let mut fsm = configured(t0, 10, 0);
        fsm.modification(t0);
        assert!(fsm.tick(t0 + 11 * SECOND).commit);
        fsm.end_save(t0 + 11 * SECOND, false);
        assert_eq!(fsm.state(), AutosaveState::Active);
        assert!(fsm.tick(t0 + 22 * SECOND).commit);
    }

    #[test]
    fn reconfigure_resets_and_zero_disables() {
        let t0 = Instant::now();
        let mut fsm = configured(t0, 300, 0);
        fsm.modification(t0);
        fsm.configure(300 * SECOND, Duration::ZERO, t0 + SECOND);
        assert_eq!(fsm.state(), AutosaveState::Active, "same intervals keep state");
        fsm.configure(120 * SECOND, Duration::ZERO, t0 + 2 * SECOND);
        assert_eq!(fsm.state(), AutosaveState::Dead);
        fsm.configure(Duration::ZERO, Duration::ZERO, t0 + 3 * SECOND);
        assert_eq!(fsm.state(), AutosaveState::Unset);
        assert_eq!(fsm.modification(t0 + 4 * SECOND), AutosaveAction::default());
        fsm.begin_save();
        assert_eq!(fsm.state(), AutosaveState::SavingWhileUnset);
        fsm.end_save(t0 + 5 * SECOND, true);
        assert_eq!(fsm.state(), AutosaveState::Unset);
    }

    #[test]
    fn timer_thread_delivers_ticks() {
        let timer = AutosaveTimer::spawn().unwrap();
        timer.apply(AutosaveAction::after(Duration::from_millis(20)));
        assert!(timer.wait_tick(Duration::from_secs(5)).is_some());
        timer.apply(AutosaveAction::after(Duration::from_secs(60)));
        timer.apply(AutosaveAction::idle());
        assert!(timer.wait_tick(Duration::from_millis(50)).is_none());
    }
}
