//! # Shim Constants
//!
//! Defaults, limits and timeouts for the shim. These constants are the
//! **single source of truth** for bounds used by the lifecycle engine and
//! the control channel.
//!
//! ## Cross-References
//!
//! - [`crate::config`]: Uses the path and timing defaults
//! - [`crate::lifecycle`]: Uses the grace period and OCI version
//! - [`crate::supervisor`]: Uses the reaper poll interval
//! - [`crate::server`]: Uses the connection and request bounds

use std::time::Duration;

// =============================================================================
// Default Paths
// =============================================================================

/// Default control socket the shim listens on.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/mica-shim.sock";

/// Default OCI runtime binary used when `Create` does not name one.
pub const DEFAULT_RUNTIME_PATH: &str = "/usr/local/bin/mica-runtime";

/// Default working directory for shim state.
pub const DEFAULT_WORK_DIR: &str = "/var/run/mica";

/// Default orchestrator namespace.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Default container ID when none is configured.
pub const DEFAULT_CONTAINER_ID: &str = "test-container";

// =============================================================================
// Timeouts
// =============================================================================

/// Default grace period between SIGTERM and SIGKILL during stop (10 seconds).
///
/// **Rationale**: Matches the containerd default stop timeout. Long enough
/// for well-behaved workloads to flush state, short enough that a hung
/// process does not pin the orchestrator.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Interval at which the reaper sweeps for exited children even without
/// a SIGCHLD notification.
///
/// SIGCHLD deliveries coalesce and may race the registration of a freshly
/// spawned pid; the periodic sweep bounds the delay of such exits.
pub const REAPER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Timeout for reading one request line from a control connection.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

// =============================================================================
// Control Channel Bounds
// =============================================================================

/// Maximum concurrent control connections.
///
/// **Security**: Bounds task and file-descriptor usage from a misbehaving
/// client opening connections in a loop.
pub const MAX_CONNECTIONS: usize = 64;

/// Maximum request line length in bytes (1 MiB).
pub const MAX_REQUEST_LINE_LEN: usize = 1024 * 1024;

/// Maximum number of command arguments for an exec session.
pub const MAX_COMMAND_ARGS: usize = 256;

/// Maximum length of a single command argument.
pub const MAX_COMMAND_ARG_LEN: usize = 4096;

/// Maximum number of recently reaped pids remembered by the supervisor.
///
/// Signals addressed to one of these pids are refused, which closes the
/// window where a reaped pid is reused by an unrelated process before the
/// state machine has applied the exit.
pub const REAPED_PID_HISTORY: usize = 256;

/// Capacity of the broadcast channel used by [`crate::events::EventBus`].
pub const EVENT_BUS_CAPACITY: usize = 1024;

// =============================================================================
// OCI
// =============================================================================

/// OCI Runtime Spec version reported in state snapshots.
pub const OCI_RUNTIME_SPEC_VERSION: &str = "1.0.2";

// =============================================================================
// Validation Patterns
// =============================================================================

/// Valid characters for container and exec IDs.
///
/// **Security**: Excludes `/`, `.`, and other characters that could be used
/// for path traversal when IDs end up in runtime arguments or paths.
pub const ID_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Maximum container or exec ID length.
pub const MAX_ID_LEN: usize = 128;

/// Validates a container ID.
///
/// # Returns
///
/// `Ok(())` if valid, `Err(reason)` with a description of the failure.
#[inline]
#[must_use = "validation result must be checked to ensure container ID is safe"]
pub fn validate_container_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("container ID cannot be empty");
    }
    if id.len() > MAX_ID_LEN {
        return Err("container ID exceeds maximum length");
    }
    if !has_valid_chars(id) {
        return Err("container ID contains invalid characters");
    }
    Ok(())
}

/// Validates an exec session ID.
#[inline]
#[must_use = "validation result must be checked to ensure exec ID is safe"]
pub fn validate_exec_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("exec ID cannot be empty");
    }
    if id.len() > MAX_ID_LEN {
        return Err("exec ID exceeds maximum length");
    }
    if !has_valid_chars(id) {
        return Err("exec ID contains invalid characters");
    }
    Ok(())
}

fn has_valid_chars(id: &str) -> bool {
    id.chars().all(|c| ID_VALID_CHARS.contains(c))
}

/// Validates an exec command line.
pub fn validate_command(command: &[String]) -> std::result::Result<(), String> {
    if command.is_empty() {
        return Err("command cannot be empty".to_string());
    }
    if command.len() > MAX_COMMAND_ARGS {
        return Err(format!(
            "too many arguments: {} > {}",
            command.len(),
            MAX_COMMAND_ARGS
        ));
    }
    if let Some(arg) = command.iter().find(|a| a.len() > MAX_COMMAND_ARG_LEN) {
        return Err(format!(
            "argument too long: {} > {} bytes",
            arg.len(),
            MAX_COMMAND_ARG_LEN
        ));
    }
    if command.iter().any(|a| a.contains('\0')) {
        return Err("argument contains NUL byte".to_string());
    }
    Ok(())
}
