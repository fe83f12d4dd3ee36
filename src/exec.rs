//! Exec sessions: additional processes run inside a live container through
//! `<runtime> exec <container-id> <command...>`.
//!
//! A session stays registered after its process exits until `wait_exec`
//! delivers the result. Its ID cannot be reused before that. Container delete
//! kills and removes every session.

use crate::constants::{validate_command, validate_exec_id};
use crate::error::{Error, Result};
use crate::lifecycle::{Context, wait_exit};
use crate::runtime::{ExecState, ExitStatus, Operation, RuntimeCommand, Signal};
use crate::state::ExecSession;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registry of the container's exec sessions.
pub struct ExecRegistry {
    ctx: Arc<Context>,
}

impl ExecRegistry {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Starts an exec session.
    ///
    /// # Errors
    ///
    /// - [`Error::ContainerNotRunning`] unless the container is Running or Paused
    /// - [`Error::DuplicateExecId`] while a session with `exec_id` is still
    ///   registered, running or holding an undelivered result
    /// - [`Error::InvalidCommand`] for a bad ID or command
    /// - [`Error::Spawn`] if the runtime cannot be started
    pub async fn exec(&self, exec_id: &str, command: Vec<String>) -> Result<ExecState> {
        validate_exec_id(exec_id)
            .map_err(|reason| Error::InvalidCommand(format!("exec ID '{exec_id}': {reason}")))?;
        validate_command(&command).map_err(Error::InvalidCommand)?;

        let (container_id, runtime) = {
            let inner = self.ctx.cell.lock()?;
            let record = inner.record(Operation::Exec)?;
            if !record.status.has_process() {
                return Err(Error::ContainerNotRunning {
                    state: record.status,
                });
            }
            if inner.execs.contains_key(exec_id) {
                return Err(Error::DuplicateExecId(exec_id.to_string()));
            }
            (record.id.clone(), record.runtime_path.clone())
        };

        let args = RuntimeCommand::exec(&container_id, &command);
        let pid = self.ctx.supervisor.spawn(&runtime, &args)?;

        let session = ExecSession::new(exec_id.to_string(), pid, command);
        let registered = self.ctx.cell.lock()?.register_exec(session);
        let events = match registered {
            Ok(events) => events,
            Err(e) => {
                warn!(exec_id, pid, error = %e, "exec registration failed, killing process");
                if let Err(kill_err) = self.ctx.signal_or_gone(pid, Signal::KILL) {
                    warn!(exec_id, pid, error = %kill_err, "failed to kill unregistered exec");
                }
                return Err(e);
            }
        };
        let snapshot = self.exec_state(exec_id)?;

        info!(id = %container_id, exec_id, pid, "exec session started");
        self.ctx.publish_all(events);
        Ok(snapshot)
    }

    /// Signals a running exec process.
    pub async fn kill_exec(&self, exec_id: &str, signal: Signal) -> Result<()> {
        let pid = {
            let inner = self.ctx.cell.lock()?;
            match inner.execs.get(exec_id) {
                Some(session) if session.is_running() => session.pid,
                _ => return Err(Error::NoSuchExec(exec_id.to_string())),
            }
        };

        debug!(exec_id, pid, %signal, "signalling exec process");
        self.ctx.supervisor.signal(pid, signal)
    }

    /// Waits for an exec process to exit, then removes the session.
    pub async fn wait_exec(&self, exec_id: &str) -> Result<ExitStatus> {
        let (pid, rx) = {
            let inner = self.ctx.cell.lock()?;
            let session = inner
                .execs
                .get(exec_id)
                .ok_or_else(|| Error::NoSuchExec(exec_id.to_string()))?;
            (session.pid, session.subscribe())
        };

        // The sender goes away only when the session is removed under us.
        let exit = wait_exit(rx, None, "wait_exec")
            .await
            .map_err(|_| Error::NoSuchExec(exec_id.to_string()))?;

        let mut inner = self.ctx.cell.lock()?;
        if inner.execs.get(exec_id).is_some_and(|s| s.pid == pid) {
            inner.execs.remove(exec_id);
            debug!(exec_id, pid, "exec session reaped");
        }
        Ok(exit)
    }

    /// Snapshot of one session.
    pub fn exec_state(&self, exec_id: &str) -> Result<ExecState> {
        self.ctx
            .cell
            .lock()?
            .execs
            .get(exec_id)
            .map(ExecSession::snapshot)
            .ok_or_else(|| Error::NoSuchExec(exec_id.to_string()))
    }

    /// Snapshots of every registered session.
    pub fn list(&self) -> Result<Vec<ExecState>> {
        let inner = self.ctx.cell.lock()?;
        let mut sessions: Vec<ExecState> = inner.execs.values().map(ExecSession::snapshot).collect();
        sessions.sort_by(|a, b| a.exec_id.cmp(&b.exec_id));
        Ok(sessions)
    }

    /// Kills every running session, waits for the exits and clears the registry.
    pub(crate) async fn terminate_all(&self) -> Result<()> {
        let live: Vec<_> = {
            let inner = self.ctx.cell.lock()?;
            inner
                .execs
                .values()
                .filter(|s| s.is_running())
                .map(|s| (s.exec_id.clone(), s.pid, s.subscribe()))
                .collect()
        };

        for (exec_id, pid, _) in &live {
            debug!(exec_id = %exec_id, pid, "killing exec session");
            self.ctx.signal_or_gone(*pid, Signal::KILL)?;
        }
        for (exec_id, pid, rx) in live {
            if let Err(e) = wait_exit(rx, None, "delete").await {
                warn!(exec_id = %exec_id, pid, error = %e, "exec exit not observed");
            }
        }

        self.ctx.cell.lock()?.execs.clear();
        Ok(())
    }
}
