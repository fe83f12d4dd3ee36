//! Lifecycle vocabulary shared by every component of the shim.
//!
//! - [`ContainerStatus`]: the five lifecycle states
//! - [`ContainerState`]: the snapshot returned by the `State` query
//! - [`ExecState`]: the snapshot of one exec session
//! - [`Signal`]: a validated signal number
//! - [`Operation`]: names of lifecycle operations (used in errors)
//! - [`RuntimeCommand`]: argument vectors for the OCI runtime binary
//!
//! # Lifecycle
//!
//! ```text
//!   ┌─────────┐   create   ┌─────────┐   start   ┌─────────┐  pause   ┌────────┐
//!   │ (none)  │ ─────────► │ Created │ ────────► │ Running │ ───────► │ Paused │
//!   └─────────┘            └────┬────┘           └────┬────┘ ◄─────── └───┬────┘
//!                               │                     │        resume     │
//!                               │ delete              │ stop / exit       │
//!                               ▼                     ▼                   │
//!                          ┌─────────┐  delete   ┌─────────┐ ◄────────────┘
//!                          │ Deleted │ ◄──────── │ Stopped │  stop / exit
//!                          └─────────┘           └─────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

// =============================================================================
// Container Status
// =============================================================================

/// Lifecycle state of the container owned by this shim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Created but the runtime process has not been started.
    Created,
    /// The runtime process is running.
    Running,
    /// The runtime process is stopped with SIGSTOP.
    Paused,
    /// The runtime process has exited.
    Stopped,
    /// The container record has been released. Terminal.
    Deleted,
}

impl ContainerStatus {
    /// Returns true if a live main process exists in this state.
    pub fn has_process(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

// =============================================================================
// Container State Snapshot
// =============================================================================

/// Consistent snapshot of the container record.
///
/// Field names follow the OCI runtime state document where one exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    /// OCI version of the state schema.
    pub oci_version: String,
    /// Container ID.
    pub id: String,
    /// Lifecycle status.
    pub status: ContainerStatus,
    /// Main process ID. Retained after the process stops.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Absolute path to the bundle directory.
    pub bundle: String,
    /// Runtime binary used for this container.
    pub runtime: String,
    /// Exit code of the main process, once stopped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Time the main process exit was observed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
    /// Time of `Create`.
    pub created_at: DateTime<Utc>,
    /// Time of a successful `Start`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Set when forced termination failed during stop.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_error: Option<String>,
}

impl ContainerState {
    /// Returns true if the container is running.
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }
}

/// Exit result of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    /// Exit status; `128 + signo` for signal deaths.
    pub exit_code: i32,
    /// Time the exit was observed.
    pub exited_at: DateTime<Utc>,
}

// =============================================================================
// Exec State
// =============================================================================

/// Status of an exec session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    /// The exec process is running.
    Running,
    /// The exec process has been reaped; the result awaits delivery.
    Exited,
}

impl std::fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// Snapshot of one exec session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecState {
    /// Caller-supplied session ID.
    pub exec_id: String,
    /// Process ID of the exec process.
    pub pid: u32,
    /// Command line.
    pub command: Vec<String>,
    /// Session status.
    pub status: ExecStatus,
    /// Exit code, once exited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Time the exit was observed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Signals
// =============================================================================

/// Highest signal number accepted (Linux `SIGRTMAX`).
pub const MAX_SIGNAL: i32 = 64;

/// Signal delivered to a container process.
///
/// Any signal number in `1..=MAX_SIGNAL` is valid. The common ones have
/// named constants and parse from their names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signal(i32);

// Named signals, in the order `parse` and `Display` consult them.
const SIGNAL_NAMES: &[(i32, &str)] = &[
    (libc::SIGHUP, "HUP"),
    (libc::SIGINT, "INT"),
    (libc::SIGQUIT, "QUIT"),
    (libc::SIGILL, "ILL"),
    (libc::SIGTRAP, "TRAP"),
    (libc::SIGABRT, "ABRT"),
    (libc::SIGBUS, "BUS"),
    (libc::SIGFPE, "FPE"),
    (libc::SIGKILL, "KILL"),
    (libc::SIGUSR1, "USR1"),
    (libc::SIGSEGV, "SEGV"),
    (libc::SIGUSR2, "USR2"),
    (libc::SIGPIPE, "PIPE"),
    (libc::SIGALRM, "ALRM"),
    (libc::SIGTERM, "TERM"),
    (libc::SIGCHLD, "CHLD"),
    (libc::SIGCONT, "CONT"),
    (libc::SIGSTOP, "STOP"),
    (libc::SIGTSTP, "TSTP"),
    (libc::SIGTTIN, "TTIN"),
    (libc::SIGTTOU, "TTOU"),
    (libc::SIGURG, "URG"),
    (libc::SIGXCPU, "XCPU"),
    (libc::SIGXFSZ, "XFSZ"),
    (libc::SIGVTALRM, "VTALRM"),
    (libc::SIGPROF, "PROF"),
    (libc::SIGWINCH, "WINCH"),
    (libc::SIGIO, "IO"),
    (libc::SIGSYS, "SYS"),
];

impl Signal {
    /// SIGTERM (graceful shutdown).
    pub const TERM: Self = Self(libc::SIGTERM);
    /// SIGKILL (force kill).
    pub const KILL: Self = Self(libc::SIGKILL);
    /// SIGHUP (hangup).
    pub const HUP: Self = Self(libc::SIGHUP);
    /// SIGINT (interrupt).
    pub const INT: Self = Self(libc::SIGINT);
    /// SIGQUIT.
    pub const QUIT: Self = Self(libc::SIGQUIT);
    /// SIGUSR1.
    pub const USR1: Self = Self(libc::SIGUSR1);
    /// SIGUSR2.
    pub const USR2: Self = Self(libc::SIGUSR2);
    /// SIGSTOP (freeze).
    pub const STOP: Self = Self(libc::SIGSTOP);
    /// SIGCONT (thaw).
    pub const CONT: Self = Self(libc::SIGCONT);

    /// Returns the signal number.
    pub fn as_i32(&self) -> i32 {
        self.0
    }

    /// Validates a raw signal number.
    pub fn from_raw(signo: i32) -> Option<Self> {
        (1..=MAX_SIGNAL).contains(&signo).then_some(Self(signo))
    }

    /// Parses from signal name or number (e.g., "SIGTERM", "TERM", "15").
    pub fn parse(s: &str) -> Option<Self> {
        if let Ok(signo) = s.trim().parse::<i32>() {
            return Self::from_raw(signo);
        }
        let s = s.trim().to_uppercase();
        let s = s.strip_prefix("SIG").unwrap_or(&s);
        SIGNAL_NAMES
            .iter()
            .find(|(_, name)| *name == s)
            .map(|&(signo, _)| Self(signo))
    }

    /// Returns the name without the `SIG` prefix, if the signal has one.
    pub fn name(&self) -> Option<&'static str> {
        SIGNAL_NAMES
            .iter()
            .find(|(signo, _)| *signo == self.0)
            .map(|&(_, name)| name)
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "SIG{name}"),
            None => write!(f, "signal {}", self.0),
        }
    }
}

// Signals travel over the control channel either as numbers or names.
impl Serialize for Signal {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.name() {
            Some(name) => serializer.serialize_str(&format!("SIG{name}")),
            None => serializer.serialize_i32(self.0),
        }
    }
}

impl<'de> Deserialize<'de> for Signal {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(i32),
            Name(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Signal::from_raw(n)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid signal number {n}"))),
            Raw::Name(name) => Signal::parse(&name)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown signal '{name}'"))),
        }
    }
}

// =============================================================================
// Operations
// =============================================================================

/// Lifecycle operation names, used in [`crate::Error::InvalidState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Start,
    Stop,
    Pause,
    Resume,
    Kill,
    Delete,
    Exec,
    Update,
    Stats,
    Wait,
    Shutdown,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Kill => "kill",
            Self::Delete => "delete",
            Self::Exec => "exec",
            Self::Update => "update",
            Self::Stats => "stats",
            Self::Wait => "wait",
            Self::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Runtime Command Lines
// =============================================================================

/// Argument vectors passed to the OCI runtime binary.
///
/// The runtime is invoked as `<runtime> start <container-id> <bundle>` for the
/// main process and `<runtime> exec <container-id> <command...>` for exec
/// sessions.
pub struct RuntimeCommand;

impl RuntimeCommand {
    /// Arguments for starting the main process.
    pub fn start(container_id: &str, bundle: &Path) -> Vec<String> {
        vec![
            "start".to_string(),
            container_id.to_string(),
            bundle.to_string_lossy().into_owned(),
        ]
    }

    /// Arguments for an exec session.
    pub fn exec(container_id: &str, command: &[String]) -> Vec<String> {
        let mut args = Vec::with_capacity(command.len() + 2);
        args.push("exec".to_string());
        args.push(container_id.to_string());
        args.extend(command.iter().cloned());
        args
    }
}
