//! Radio daemon supervisor: renders configs, launches the child, restarts
//! it with backoff, and exposes reload/reset/halt control primitives.

pub mod render;

use std::collections::VecDeque;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};

/// Default "dying too quickly" window: N failures inside P seconds.
pub const DEFAULT_RESTART_THRESHOLD: usize = 4;
pub const DEFAULT_RESTART_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(5);
pub const HALT_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to launch radio daemon: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("failed to render config: {0}")]
    Render(String),
    #[error("no running child to signal")]
    NoChild,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioSignal {
    /// Re-read VAP config and reload in place (SIGHUP-equivalent).
    Reload,
    /// Full restart (SIGUSR1-equivalent in this deployment).
    Reset,
}

/// Tracks recent child-process start timestamps to detect "dying too
/// quickly" (the default policy: disable further evaluation once 4 starts
/// land within a 60-second window).
///
/// Timestamps are caller-supplied monotonic seconds rather than [`Instant`]
/// so the escalation logic is deterministically testable.
#[derive(Debug, Default)]
pub struct RestartTracker {
    starts: VecDeque<u64>,
    threshold: usize,
    window_secs: u64,
    suspended: bool,
}

impl RestartTracker {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            starts: VecDeque::new(),
            threshold,
            window_secs: window.as_secs(),
            suspended: false,
        }
    }

    /// Records a child start at `now` (monotonic seconds) and returns
    /// whether evaluation should now be suspended.
    pub fn record_start(&mut self, now: u64) -> bool {
        self.starts.push_back(now);
        while let Some(&front) = self.starts.front() {
            if now.saturating_sub(front) > self.window_secs {
                self.starts.pop_front();
            } else {
                break;
            }
        }
        if self.starts.len() >= self.threshold {
            self.suspended = true;
        }
        self.suspended
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Called when the configuration tree changes; lifts suspension and
    /// clears start history so the next failure sequence starts fresh.
    pub fn clear(&mut self) {
        self.starts.clear();
        self.suspended = false;
    }
}

/// Sends a reload or reset signal to the given pid.
#[cfg(unix)]
pub fn send_signal(pid: i32, signal: RadioSignal) -> std::io::Result<()> {
    let sig = match signal {
        RadioSignal::Reload => libc::SIGHUP,
        RadioSignal::Reset => libc::SIGUSR1,
    };
    let ret = unsafe { libc::kill(pid, sig) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn kill_hard(pid: i32) -> std::io::Result<()> {
    let ret = unsafe { libc::kill(pid, libc::SIGKILL) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Renders configs for the active device set and spawns the radio daemon.
/// stdout/stderr are piped so the caller can forward them into the logger.
pub async fn launch_radio_daemon(binary: &Path, config_paths: &[PathBuf], verbosity: u8) -> Result<Child, Error> {
    let mut cmd = Command::new(binary);
    for path in config_paths {
        cmd.arg(path);
    }
    cmd.arg("-d").arg(verbosity.to_string());
    cmd.kill_on_drop(true);
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    let child = cmd.spawn()?;
    Ok(child)
}

/// Owns the currently-running child's pid and the restart tracker; exposes
/// reload/reset/halt as the only ways the rest of the system touches the
/// child process.
pub struct Supervisor {
    child_pid: Mutex<Option<i32>>,
    tracker: Mutex<RestartTracker>,
    running: AtomicBool,
    evaluate: AtomicBool,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            child_pid: Mutex::new(None),
            tracker: Mutex::new(RestartTracker::new(DEFAULT_RESTART_THRESHOLD, DEFAULT_RESTART_WINDOW)),
            running: AtomicBool::new(true),
            evaluate: AtomicBool::new(true),
        }
    }

    pub fn set_child_pid(&self, pid: Option<i32>) {
        *self.child_pid.lock().unwrap() = pid;
    }

    pub fn child_pid(&self) -> Option<i32> {
        *self.child_pid.lock().unwrap()
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn request_evaluate(&self) {
        self.evaluate.store(true, Ordering::SeqCst);
    }

    pub fn take_evaluate(&self) -> bool {
        self.evaluate.swap(false, Ordering::SeqCst)
    }

    /// Records a start and reports whether re-evaluation should be
    /// suspended from now on ("dying too quickly").
    pub fn record_start(&self, now: u64) -> bool {
        self.tracker.lock().unwrap().record_start(now)
    }

    pub fn is_evaluation_suspended(&self) -> bool {
        self.tracker.lock().unwrap().is_suspended()
    }

    /// Lifts "dying too quickly" suspension; called when the config tree
    /// changes underneath a suspended supervisor.
    pub fn clear_restart_history(&self) {
        self.tracker.lock().unwrap().clear();
    }

    #[cfg(unix)]
    pub fn reload(&self) -> Result<(), Error> {
        let pid = self.child_pid().ok_or(Error::NoChild)?;
        send_signal(pid, RadioSignal::Reload).map_err(Error::Spawn)
    }

    #[cfg(unix)]
    pub fn reset(&self) -> Result<(), Error> {
        let pid = self.child_pid().ok_or(Error::NoChild)?;
        send_signal(pid, RadioSignal::Reset).map_err(Error::Spawn)
    }

    /// Sends reset; if the child has not exited (to be relaunched with a
    /// new pid) within [`HALT_GRACE`], escalates to SIGKILL.
    #[cfg(unix)]
    pub async fn halt(&self, child: &mut Child) -> Result<(), Error> {
        let pid = self.child_pid().ok_or(Error::NoChild)?;
        send_signal(pid, RadioSignal::Reset).map_err(Error::Spawn)?;
        match tokio::time::timeout(HALT_GRACE, child.wait()).await {
            Ok(_) => Ok(()),
            Err(_) => kill_hard(pid).map_err(Error::Spawn),
        }
    }
}

pub fn exit_was_signal(status: std::process::ExitStatus) -> Option<i32> {
    status.signal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_tracker_suspends_after_threshold_within_window() {
        let mut tracker = RestartTracker::new(4, Duration::from_secs(60));
        assert!(!tracker.record_start(0));
        assert!(!tracker.record_start(10));
        assert!(!tracker.record_start(20));
        assert!(tracker.record_start(30));
        assert!(tracker.is_suspended());
    }

    #[test]
    fn restart_tracker_does_not_suspend_when_spread_out() {
        let mut tracker = RestartTracker::new(4, Duration::from_secs(60));
        assert!(!tracker.record_start(0));
        assert!(!tracker.record_start(70));
        assert!(!tracker.record_start(140));
        assert!(!tracker.record_start(210));
        assert!(!tracker.is_suspended());
    }

    #[test]
    fn restart_tracker_clear_lifts_suspension() {
        let mut tracker = RestartTracker::new(2, Duration::from_secs(60));
        tracker.record_start(0);
        assert!(tracker.record_start(1));
        tracker.clear();
        assert!(!tracker.is_suspended());
    }

    #[test]
    fn supervisor_reload_without_child_errors() {
        let supervisor = Supervisor::new();
        assert!(matches!(supervisor.reload(), Err(Error::NoChild)));
    }

    #[test]
    fn supervisor_take_evaluate_consumes_flag_once() {
        let supervisor = Supervisor::new();
        assert!(supervisor.take_evaluate());
        assert!(!supervisor.take_evaluate());
        supervisor.request_evaluate();
        assert!(supervisor.take_evaluate());
    }
}
