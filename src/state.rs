//! # Container Cell
//!
//! The container record, the exec sessions and undelivered exits live behind
//! one `std::sync::Mutex`. It is held only to read or mutate these values and
//! never across an `.await`, so read-only queries wait at most for a
//! snapshot copy.
//!
//! ## Exit Application
//!
//! The reaper reports exits by pid. [`Inner::apply_exit`] matches the pid
//! against the main process, then against live exec sessions. An exit that
//! matches neither (the reaper won the race against pid registration) is
//! kept in `pending_exits` and applied when the pid is registered.
//!
//! Only exit application moves the main process into `Stopped`. Stop merely
//! signals and waits, so a racing stop and exit yield one transition.
//!
//! Waiters are woken only after the exit event has been published, so a
//! caller returning from stop or wait never races ahead of the `/tasks/exit`
//! event.

use crate::constants::{OCI_RUNTIME_SPEC_VERSION, REAPED_PID_HISTORY};
use crate::error::{Error, Result};
use crate::events::{EventPublisher, TaskEvent};
use crate::runtime::{
    ContainerState, ContainerStatus, ExecState, ExecStatus, ExitStatus, Operation,
};
use crate::supervisor::ExitEvent;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// The one container owned by the shim.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub id: String,
    pub bundle_path: PathBuf,
    pub runtime_path: PathBuf,
    pub status: ContainerStatus,
    /// Set once by Start, retained after the process stops.
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub exited_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub termination_error: Option<String>,
}

impl ContainerRecord {
    pub fn new(id: String, bundle_path: PathBuf, runtime_path: PathBuf) -> Self {
        Self {
            id,
            bundle_path,
            runtime_path,
            status: ContainerStatus::Created,
            pid: None,
            exit_code: None,
            exited_at: None,
            created_at: Utc::now(),
            started_at: None,
            termination_error: None,
        }
    }

    /// Recorded exit of the main process, if it has stopped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        Some(ExitStatus {
            exit_code: self.exit_code?,
            exited_at: self.exited_at?,
        })
    }

    pub fn snapshot(&self) -> ContainerState {
        ContainerState {
            oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
            id: self.id.clone(),
            status: self.status,
            pid: self.pid,
            bundle: self.bundle_path.to_string_lossy().into_owned(),
            runtime: self.runtime_path.to_string_lossy().into_owned(),
            exit_code: self.exit_code,
            exited_at: self.exited_at,
            created_at: self.created_at,
            started_at: self.started_at,
            termination_error: self.termination_error.clone(),
        }
    }
}

/// One exec process.
#[derive(Debug)]
pub struct ExecSession {
    pub exec_id: String,
    pub pid: u32,
    pub command: Vec<String>,
    pub status: ExecStatus,
    pub exit: Option<ExitStatus>,
    exit_tx: watch::Sender<Option<ExitStatus>>,
}

impl ExecSession {
    pub fn new(exec_id: String, pid: u32, command: Vec<String>) -> Self {
        let (exit_tx, _) = watch::channel(None);
        Self {
            exec_id,
            pid,
            command,
            status: ExecStatus::Running,
            exit: None,
            exit_tx,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ExecStatus::Running
    }

    /// Receiver that resolves once the session has exited.
    pub fn subscribe(&self) -> watch::Receiver<Option<ExitStatus>> {
        self.exit_tx.subscribe()
    }

    fn finish(&mut self, exit: ExitStatus) {
        self.status = ExecStatus::Exited;
        self.exit = Some(exit);
    }

    pub fn snapshot(&self) -> ExecState {
        ExecState {
            exec_id: self.exec_id.clone(),
            pid: self.pid,
            command: self.command.clone(),
            status: self.status,
            exit_code: self.exit.map(|e| e.exit_code),
            exited_at: self.exit.map(|e| e.exited_at),
        }
    }
}

/// Watch channel to fill once an applied exit has been published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ExitWaiter {
    Main,
    Exec(String),
}

/// An exit recorded in the cell whose waiters have not been woken yet.
#[derive(Debug, Clone)]
pub(crate) struct AppliedExit {
    pub(crate) event: TaskEvent,
    pub(crate) waiter: ExitWaiter,
    pub(crate) pid: u32,
    pub(crate) exit: ExitStatus,
}

/// Lifecycle slot of the cell.
#[derive(Debug)]
pub(crate) enum Slot {
    /// Before Create.
    Empty,
    Live(ContainerRecord),
    /// After Delete; keeps the final snapshot for State queries.
    Deleted(ContainerState),
}

pub(crate) struct Inner {
    pub(crate) slot: Slot,
    pub(crate) execs: HashMap<String, ExecSession>,
    pending_exits: HashMap<u32, ExitStatus>,
    main_exit: watch::Sender<Option<ExitStatus>>,
}

impl Inner {
    /// The live record, or the error `operation` reports without one.
    pub(crate) fn record(&self, operation: Operation) -> Result<&ContainerRecord> {
        match &self.slot {
            Slot::Live(record) => Ok(record),
            Slot::Empty => Err(Error::NotCreated),
            Slot::Deleted(_) => Err(Error::invalid_state(operation, ContainerStatus::Deleted)),
        }
    }

    pub(crate) fn record_mut(&mut self, operation: Operation) -> Result<&mut ContainerRecord> {
        match &mut self.slot {
            Slot::Live(record) => Ok(record),
            Slot::Empty => Err(Error::NotCreated),
            Slot::Deleted(_) => Err(Error::invalid_state(operation, ContainerStatus::Deleted)),
        }
    }

    /// Current status, `None` before Create.
    pub(crate) fn status(&self) -> Option<ContainerStatus> {
        match &self.slot {
            Slot::Empty => None,
            Slot::Live(record) => Some(record.status),
            Slot::Deleted(_) => Some(ContainerStatus::Deleted),
        }
    }

    pub(crate) fn subscribe_main_exit(&self) -> watch::Receiver<Option<ExitStatus>> {
        self.main_exit.subscribe()
    }

    /// Pids of exec sessions still running.
    pub(crate) fn live_exec_pids(&self) -> Vec<u32> {
        self.execs
            .values()
            .filter(|s| s.is_running())
            .map(|s| s.pid)
            .collect()
    }

    /// Records a freshly started main process.
    pub(crate) fn register_main(&mut self, pid: u32) -> Result<Vec<TaskEvent>> {
        let pending = self.pending_exits.remove(&pid);
        let record = self.record_mut(Operation::Start)?;
        record.pid = Some(pid);
        record.status = ContainerStatus::Running;
        record.started_at = Some(Utc::now());

        let mut events = vec![TaskEvent::Started {
            id: record.id.clone(),
            pid,
        }];
        if let Some(exit) = pending
            && let Some(applied) = self.apply_exit(pid, exit)
        {
            self.wake(&applied);
            events.push(applied.event);
        }
        Ok(events)
    }

    /// Records a freshly started exec process.
    pub(crate) fn register_exec(&mut self, session: ExecSession) -> Result<Vec<TaskEvent>> {
        let id = self.record(Operation::Exec)?.id.clone();
        if self.execs.contains_key(&session.exec_id) {
            return Err(Error::DuplicateExecId(session.exec_id));
        }
        let pid = session.pid;
        let mut events = vec![TaskEvent::ExecStarted {
            id,
            exec_id: session.exec_id.clone(),
            pid,
        }];

        self.execs.insert(session.exec_id.clone(), session);
        if let Some(exit) = self.pending_exits.remove(&pid)
            && let Some(applied) = self.apply_exit(pid, exit)
        {
            self.wake(&applied);
            events.push(applied.event);
        }
        Ok(events)
    }

    /// Records one reaper exit. Waiters are not woken; see [`Inner::wake`].
    pub(crate) fn apply_exit(&mut self, pid: u32, exit: ExitStatus) -> Option<AppliedExit> {
        if let Slot::Live(record) = &mut self.slot
            && record.pid == Some(pid)
            && record.status.has_process()
        {
            record.status = ContainerStatus::Stopped;
            record.exit_code = Some(exit.exit_code);
            record.exited_at = Some(exit.exited_at);
            info!(id = %record.id, pid, exit_code = exit.exit_code, "container stopped");
            return Some(AppliedExit {
                event: TaskEvent::Exited {
                    id: record.id.clone(),
                    pid,
                    exit_code: exit.exit_code,
                    exited_at: exit.exited_at,
                },
                waiter: ExitWaiter::Main,
                pid,
                exit,
            });
        }

        let container_id = match &self.slot {
            Slot::Live(record) => record.id.clone(),
            Slot::Deleted(state) => state.id.clone(),
            Slot::Empty => String::new(),
        };
        if let Some(session) = self
            .execs
            .values_mut()
            .find(|s| s.pid == pid && s.is_running())
        {
            session.finish(exit);
            info!(exec_id = %session.exec_id, pid, exit_code = exit.exit_code, "exec process exited");
            return Some(AppliedExit {
                event: TaskEvent::ExecExited {
                    id: container_id,
                    exec_id: session.exec_id.clone(),
                    pid,
                    exit_code: exit.exit_code,
                    exited_at: exit.exited_at,
                },
                waiter: ExitWaiter::Exec(session.exec_id.clone()),
                pid,
                exit,
            });
        }

        if self.pending_exits.len() >= REAPED_PID_HISTORY {
            warn!(pid, "too many unclaimed exits, dropping oldest");
            if let Some(&oldest) = self
                .pending_exits
                .iter()
                .min_by_key(|(_, e)| e.exited_at)
                .map(|(p, _)| p)
            {
                self.pending_exits.remove(&oldest);
            }
        }
        debug!(pid, exit_code = exit.exit_code, "exit for unregistered pid retained");
        self.pending_exits.insert(pid, exit);
        None
    }

    /// Fills the watch channel of an applied exit.
    pub(crate) fn wake(&self, applied: &AppliedExit) {
        match &applied.waiter {
            ExitWaiter::Main => {
                self.main_exit.send_replace(Some(applied.exit));
            }
            ExitWaiter::Exec(exec_id) => {
                if let Some(session) = self.execs.get(exec_id)
                    && session.pid == applied.pid
                {
                    session.exit_tx.send_replace(Some(applied.exit));
                }
            }
        }
    }

    /// Moves the record into the deleted slot.
    pub(crate) fn release(&mut self) -> Result<ContainerState> {
        let record = self.record(Operation::Delete)?;
        let mut snapshot = record.snapshot();
        snapshot.status = ContainerStatus::Deleted;

        self.execs.clear();
        self.pending_exits.clear();
        self.slot = Slot::Deleted(snapshot.clone());
        Ok(snapshot)
    }

    #[cfg(test)]
    pub(crate) fn pending_exit_count(&self) -> usize {
        self.pending_exits.len()
    }
}

/// Lock-guarded container state shared by the lifecycle engine, the exec
/// registry and the exit delivery task.
pub struct ContainerCell {
    inner: Mutex<Inner>,
}

impl ContainerCell {
    pub fn new() -> Self {
        let (main_exit, _) = watch::channel(None);
        Self {
            inner: Mutex::new(Inner {
                slot: Slot::Empty,
                execs: HashMap::new(),
                pending_exits: HashMap::new(),
                main_exit,
            }),
        }
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(Error::poisoned)
    }

    /// Applies a reaper event: records it, publishes it, then wakes waiters.
    pub fn apply_exit(&self, event: ExitEvent, publisher: &dyn EventPublisher) -> Result<()> {
        let exit = ExitStatus {
            exit_code: event.exit_code,
            exited_at: event.exited_at,
        };
        let applied = self.lock()?.apply_exit(event.pid, exit);
        if let Some(applied) = applied {
            publisher.publish(applied.event.clone());
            self.lock()?.wake(&applied);
        }
        Ok(())
    }

    /// Snapshot of the container; `NotCreated` before Create.
    pub fn snapshot(&self) -> Result<ContainerState> {
        let inner = self.lock()?;
        match &inner.slot {
            Slot::Empty => Err(Error::NotCreated),
            Slot::Live(record) => Ok(record.snapshot()),
            Slot::Deleted(state) => Ok(state.clone()),
        }
    }
}

impl Default for ContainerCell {
    fn default() -> Self {
        Self::new()
    }
}
