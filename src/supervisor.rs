//! # Process Supervisor
//!
//! The only component that creates, signals and reaps OS processes.
//!
//! ## Reaper
//!
//! ```text
//!   SIGCHLD ──┐
//!   tick ─────┼──► sweep() ──► waitpid ──► ExitEvent ──► mpsc ──► state machine
//!   spawn ────┘
//! ```
//!
//! Every spawned pid is tracked until it is reaped. The reaper wakes on
//! SIGCHLD, on a periodic tick, and right after each spawn, then collects
//! every tracked child that has exited. A pid leaves the tracked set under
//! the same lock that reaps it, so an exit is reported exactly once.
//!
//! In orphan mode (shim running as child subreaper) the sweep uses
//! `waitpid(-1)` so re-parented grandchildren do not accumulate as zombies.
//! Otherwise only tracked pids are waited on, which leaves other children of
//! the process (and other supervisors in the same process) untouched.
//!
//! ## PID Reuse
//!
//! Recently reaped pids are remembered; signals addressed to them fail with
//! [`Error::NoSuchProcess`] instead of reaching whatever process reuses the
//! number.

use crate::constants::{REAPED_PID_HISTORY, REAPER_POLL_INTERVAL};
use crate::error::{Error, Result, SpawnError};
use crate::runtime::Signal;
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::signal::unix::{Signal as UnixSignal, SignalKind, signal as unix_signal};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

/// Exit code reported when a tracked child was reaped by someone else and
/// its status is unknown.
pub const UNKNOWN_EXIT_CODE: i32 = 255;

const SPAWN_BUSY_RETRIES: u32 = 5;
const SPAWN_BUSY_BACKOFF: Duration = Duration::from_millis(10);

// =============================================================================
// Exit Events
// =============================================================================

/// Exit of a supervised process, reported once by the reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitEvent {
    /// Process ID.
    pub pid: u32,
    /// Exit status; `128 + signo` for signal deaths.
    pub exit_code: i32,
    /// Time the reaper collected the process.
    pub exited_at: DateTime<Utc>,
}

/// Receiving end of the reaper channel.
pub type ExitReceiver = mpsc::UnboundedReceiver<ExitEvent>;

// =============================================================================
// Supervisor Trait
// =============================================================================

/// OS process capability used by the lifecycle engine.
///
/// Implementations report exits asynchronously through the [`ExitReceiver`]
/// returned at construction; `spawn` and `signal` never wait for a process.
pub trait ProcessSupervisor: Send + Sync {
    /// Creates a new process running `program` with `args` and returns its pid.
    ///
    /// # Errors
    ///
    /// [`Error::Spawn`] if the executable is missing, not executable, fails to
    /// exec in the child, or the child cannot be created.
    fn spawn(&self, program: &Path, args: &[String]) -> Result<u32>;

    /// Delivers `signal` to `pid`.
    ///
    /// # Errors
    ///
    /// [`Error::NoSuchProcess`] or [`Error::PermissionDenied`].
    fn signal(&self, pid: u32, signal: Signal) -> Result<()>;
}

/// Checks that `path` is an executable regular file.
pub fn check_executable(path: &Path) -> std::result::Result<(), SpawnError> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SpawnError::ExecutableNotFound {
                path: path.to_path_buf(),
            });
        }
        Err(_) => {
            return Err(SpawnError::NotExecutable {
                path: path.to_path_buf(),
            });
        }
    };

    if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
        return Err(SpawnError::NotExecutable {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

// =============================================================================
// Native Supervisor
// =============================================================================

/// Pids the reaper is responsible for.
#[derive(Debug, Default)]
struct Tracking {
    live: HashSet<u32>,
    reaped: VecDeque<u32>,
}

impl Tracking {
    fn mark_reaped(&mut self, pid: u32) -> bool {
        if !self.live.remove(&pid) {
            return false;
        }
        if self.reaped.len() >= REAPED_PID_HISTORY {
            self.reaped.pop_front();
        }
        self.reaped.push_back(pid);
        true
    }
}

struct ReaperShared {
    tracking: Mutex<Tracking>,
    exits: mpsc::UnboundedSender<ExitEvent>,
    wake: Notify,
    reap_orphans: bool,
}

impl ReaperShared {
    fn tracking(&self) -> MutexGuard<'_, Tracking> {
        // The tracked set stays consistent even if a holder panicked.
        self.tracking.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// [`ProcessSupervisor`] backed by fork/exec, `kill(2)` and `waitpid(2)`.
///
/// ## Thread Safety
///
/// `Send + Sync`; the tracked-pid set is protected by an internal mutex that
/// is held across `spawn` so the reaper can never collect a child before it
/// is tracked.
///
/// ## Runtime Requirement
///
/// Construction spawns the reaper task and must happen inside a Tokio
/// runtime. The task ends once the [`ExitReceiver`] is dropped.
pub struct NativeSupervisor {
    shared: Arc<ReaperShared>,
}

impl NativeSupervisor {
    /// Creates a supervisor that reaps only the processes it spawned.
    pub fn new() -> (Self, ExitReceiver) {
        Self::with_options(false, REAPER_POLL_INTERVAL)
    }

    /// Creates a supervisor; with `reap_orphans` it also collects
    /// re-parented descendants (use together with a child subreaper).
    pub fn with_orphan_reaping(reap_orphans: bool) -> (Self, ExitReceiver) {
        Self::with_options(reap_orphans, REAPER_POLL_INTERVAL)
    }

    /// Creates a supervisor with an explicit reaper poll interval.
    pub fn with_options(reap_orphans: bool, poll_interval: Duration) -> (Self, ExitReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ReaperShared {
            tracking: Mutex::new(Tracking::default()),
            exits: tx,
            wake: Notify::new(),
            reap_orphans,
        });

        tokio::spawn(reap_loop(Arc::clone(&shared), poll_interval));
        debug!(reap_orphans, "reaper started");

        (Self { shared }, rx)
    }

    /// Number of spawned processes not yet reaped.
    pub fn tracked_count(&self) -> usize {
        self.shared.tracking().live.len()
    }
}

impl ProcessSupervisor for NativeSupervisor {
    fn spawn(&self, program: &Path, args: &[String]) -> Result<u32> {
        check_executable(program)?;

        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).process_group(0);

        // The tracking lock covers each fork but not the backoff between attempts.
        let pid = retry_busy(|| {
            let mut tracking = self.shared.tracking();
            let child = cmd.spawn()?;
            // Dropping std's Child neither waits nor kills; the reaper owns it.
            let pid = child.id();
            tracking.live.insert(pid);
            tracking.reaped.retain(|&p| p != pid);
            Ok(pid)
        })
        .map_err(|e| classify_spawn_error(program, e))?;

        self.shared.wake.notify_one();
        info!(pid, program = %program.display(), "spawned process");
        Ok(pid)
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<()> {
        let raw_pid = match i32::try_from(pid) {
            Ok(p) if p > 0 => p,
            _ => return Err(Error::NoSuchProcess { pid }),
        };

        if self.shared.tracking().reaped.contains(&pid) {
            return Err(Error::NoSuchProcess { pid });
        }

        debug!(pid, %signal, "sending signal");
        // SAFETY: kill(2) with a positive pid targets exactly one process and
        // has no memory-safety preconditions.
        let ret = unsafe { libc::kill(raw_pid, signal.as_i32()) };
        if ret == 0 {
            return Ok(());
        }

        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Err(Error::NoSuchProcess { pid }),
            Some(libc::EPERM) => Err(Error::PermissionDenied { pid }),
            _ => Err(Error::Io(err)),
        }
    }
}

/// Spawns, retrying while the executable is still open for writing elsewhere.
///
/// A file written just before exec can briefly report ETXTBSY when another
/// thread forked while the writer's descriptor was open.
fn retry_busy<T>(mut spawn: impl FnMut() -> std::io::Result<T>) -> std::io::Result<T> {
    let mut attempt = 0;
    loop {
        match spawn() {
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempt < SPAWN_BUSY_RETRIES => {
                attempt += 1;
                std::thread::sleep(SPAWN_BUSY_BACKOFF);
            }
            result => return result,
        }
    }
}

/// Splits spawn failures into parent-side and child-side errors.
fn classify_spawn_error(program: &Path, err: std::io::Error) -> SpawnError {
    match err.raw_os_error() {
        Some(libc::EAGAIN) | Some(libc::ENOMEM) | Some(libc::EMFILE) | Some(libc::ENFILE) => {
            SpawnError::Fork { source: err }
        }
        _ => SpawnError::ChildExec {
            path: program.to_path_buf(),
            source: err,
        },
    }
}

// =============================================================================
// Reaper Loop
// =============================================================================

async fn reap_loop(shared: Arc<ReaperShared>, poll_interval: Duration) {
    let mut sigchld = match unix_signal(SignalKind::child()) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, "SIGCHLD handler unavailable, reaper will poll");
            None
        }
    };

    let mut tick = tokio::time::interval(poll_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = next_sigchld(&mut sigchld) => {}
            _ = tick.tick() => {}
            _ = shared.wake.notified() => {}
        }

        sweep(&shared);

        if shared.exits.is_closed() {
            debug!("exit receiver dropped, reaper stopping");
            break;
        }
    }
}

async fn next_sigchld(sigchld: &mut Option<UnixSignal>) {
    match sigchld {
        Some(s) => {
            if s.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

/// Collects every exited child the reaper is responsible for.
fn sweep(shared: &ReaperShared) {
    let mut tracking = shared.tracking();

    if shared.reap_orphans {
        while let Some((pid, exit_code)) = wait_any() {
            if tracking.mark_reaped(pid) {
                report(shared, pid, exit_code);
            } else {
                debug!(pid, exit_code, "reaped orphan process");
            }
        }
        return;
    }

    let pids: Vec<u32> = tracking.live.iter().copied().collect();
    for pid in pids {
        match wait_pid(pid) {
            WaitOutcome::Running => {}
            WaitOutcome::Exited(exit_code) => {
                tracking.mark_reaped(pid);
                report(shared, pid, exit_code);
            }
            WaitOutcome::Gone => {
                warn!(pid, "tracked child was reaped elsewhere, exit status unknown");
                tracking.mark_reaped(pid);
                report(shared, pid, UNKNOWN_EXIT_CODE);
            }
        }
    }
}

fn report(shared: &ReaperShared, pid: u32, exit_code: i32) {
    debug!(pid, exit_code, "reaped process");
    let event = ExitEvent {
        pid,
        exit_code,
        exited_at: Utc::now(),
    };
    if shared.exits.send(event).is_err() {
        warn!(pid, exit_code, "exit receiver closed, exit dropped");
    }
}

enum WaitOutcome {
    Running,
    Exited(i32),
    Gone,
}

fn wait_pid(pid: u32) -> WaitOutcome {
    let mut status: libc::c_int = 0;
    // SAFETY: waitpid with WNOHANG on a specific pid never blocks and only
    // writes to `status`.
    let ret = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, libc::WNOHANG) };
    match ret {
        0 => WaitOutcome::Running,
        r if r > 0 => WaitOutcome::Exited(decode_status(status)),
        _ => match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EINTR) => WaitOutcome::Running,
            _ => WaitOutcome::Gone,
        },
    }
}

/// Reaps any exited child, returns (pid, exit_code) if one was collected.
fn wait_any() -> Option<(u32, i32)> {
    let mut status: libc::c_int = 0;
    // SAFETY: waitpid with WNOHANG is safe, -1 means any child.
    let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
    if pid > 0 {
        Some((pid as u32, decode_status(status)))
    } else {
        None
    }
}

/// Shell convention: exit status, or 128 + signal number.
fn decode_status(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        1
    }
}
