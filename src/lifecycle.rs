//! # Lifecycle State Machine
//!
//! Validates and executes container transitions, delegating OS work to the
//! [`ProcessSupervisor`] and resource queries to the [`ResourceAccessor`].
//!
//! ## Transitions
//!
//! | Operation | Valid from | Result |
//! |-----------|------------|--------|
//! | create | (none) | Created |
//! | start | Created | Running |
//! | pause | Running | Paused |
//! | resume | Paused | Running |
//! | stop | Running, Paused, Stopped | Stopped |
//! | kill | Running, Paused | unchanged (SIGSTOP/SIGCONT to main pause/resume) |
//! | delete | Created, Stopped (Running/Paused stop first) | Deleted |
//!
//! An invalid operation fails with [`Error::InvalidState`] before touching
//! the record.
//!
//! ## Exit Delivery
//!
//! ```text
//!   reaper ──ExitEvent──► deliver_exits ──lock──► Inner::apply_exit
//!                                                   │
//!                       stop()/wait() ◄──watch──────┘
//! ```
//!
//! A background task owns the reaper channel and applies every exit under
//! the cell lock. Stop and Wait never transition the record themselves;
//! they wait on a watch channel that exit application fills.
//!
//! ## Serialization
//!
//! The state machine does not order mutations against each other; callers
//! go through [`crate::dispatcher::RequestDispatcher`], which does.

use crate::constants::{DEFAULT_GRACE_PERIOD, validate_container_id};
use crate::error::{Error, Result};
use crate::events::{EventPublisher, TaskEvent, TracingPublisher};
use crate::exec::ExecRegistry;
use crate::resources::{ContainerStats, LinuxResources, ResourceAccessor};
use crate::runtime::{
    ContainerState, ContainerStatus, ExitStatus, Operation, RuntimeCommand, Signal,
};
use crate::state::{ContainerCell, ContainerRecord, Slot};
use crate::supervisor::{ExitReceiver, ProcessSupervisor, check_executable};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Collaborators shared by the state machine, the exec registry and the
/// exit delivery task.
pub(crate) struct Context {
    pub(crate) cell: ContainerCell,
    pub(crate) supervisor: Arc<dyn ProcessSupervisor>,
    pub(crate) resources: Arc<dyn ResourceAccessor>,
    pub(crate) events: Arc<dyn EventPublisher>,
}

impl Context {
    pub(crate) fn publish_all(&self, events: impl IntoIterator<Item = TaskEvent>) {
        for event in events {
            self.events.publish(event);
        }
    }

    /// Sends a signal, treating an already-gone process as delivered.
    pub(crate) fn signal_or_gone(&self, pid: u32, signal: Signal) -> Result<()> {
        match self.supervisor.signal(pid, signal) {
            Ok(()) | Err(Error::NoSuchProcess { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Waits until an exit is published on `rx`, optionally bounded.
pub(crate) async fn wait_exit(
    mut rx: watch::Receiver<Option<ExitStatus>>,
    limit: Option<Duration>,
    operation: &str,
) -> Result<ExitStatus> {
    let wait = async {
        let value = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Internal(format!("{operation}: exit channel closed")))?;
        (*value).ok_or_else(|| Error::Internal(format!("{operation}: exit status missing")))
    };

    match limit {
        None => wait.await,
        Some(duration) => tokio::time::timeout(duration, wait)
            .await
            .map_err(|_| Error::Timeout {
                operation: operation.to_string(),
                duration,
            })?,
    }
}

/// Builder for [`LifecycleStateMachine`].
pub struct LifecycleBuilder {
    supervisor: Arc<dyn ProcessSupervisor>,
    exits: ExitReceiver,
    resources: Option<Arc<dyn ResourceAccessor>>,
    events: Option<Arc<dyn EventPublisher>>,
    grace_period: Duration,
}

impl LifecycleBuilder {
    /// Resource accessor (default: [`crate::resources::detect`]).
    pub fn resources(mut self, resources: Arc<dyn ResourceAccessor>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Event publisher (default: [`TracingPublisher`]).
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Time between SIGTERM and SIGKILL during stop.
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Builds the state machine and starts exit delivery.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn build(self) -> LifecycleStateMachine {
        let ctx = Arc::new(Context {
            cell: ContainerCell::new(),
            supervisor: self.supervisor,
            resources: self.resources.unwrap_or_else(crate::resources::detect),
            events: self.events.unwrap_or_else(|| Arc::new(TracingPublisher)),
        });

        let exit_task = tokio::spawn(deliver_exits(Arc::clone(&ctx), self.exits));

        LifecycleStateMachine {
            execs: ExecRegistry::new(Arc::clone(&ctx)),
            ctx,
            grace_period: self.grace_period,
            exit_task,
        }
    }
}

async fn deliver_exits(ctx: Arc<Context>, mut exits: ExitReceiver) {
    while let Some(event) = exits.recv().await {
        if let Err(e) = ctx.cell.apply_exit(event, ctx.events.as_ref()) {
            error!(pid = event.pid, error = %e, "failed to apply exit");
        }
    }
    debug!("exit channel closed, delivery stopped");
}

/// Owner of the container lifecycle.
pub struct LifecycleStateMachine {
    ctx: Arc<Context>,
    execs: ExecRegistry,
    grace_period: Duration,
    exit_task: JoinHandle<()>,
}

impl LifecycleStateMachine {
    /// Starts building a state machine fed by `exits`.
    pub fn builder(supervisor: Arc<dyn ProcessSupervisor>, exits: ExitReceiver) -> LifecycleBuilder {
        LifecycleBuilder {
            supervisor,
            exits,
            resources: None,
            events: None,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Exec sessions of this container.
    pub fn execs(&self) -> &ExecRegistry {
        &self.execs
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Allocates the container record.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if a container was already created
    /// - [`Error::InvalidContainerId`], [`Error::InvalidBundle`] or
    ///   [`Error::InvalidRuntime`] on bad input
    pub async fn create(&self, id: &str, bundle: &Path, runtime: &Path) -> Result<ContainerState> {
        if let Some(status) = self.ctx.cell.lock()?.status() {
            return Err(Error::invalid_state(Operation::Create, status));
        }

        validate_container_id(id).map_err(|reason| Error::InvalidContainerId {
            id: id.to_string(),
            reason: reason.to_string(),
        })?;
        let bundle_path = validate_bundle(bundle)?;
        check_executable(runtime).map_err(|e| Error::InvalidRuntime {
            path: runtime.to_path_buf(),
            reason: e.to_string(),
        })?;

        let record = ContainerRecord::new(id.to_string(), bundle_path, runtime.to_path_buf());
        let snapshot = record.snapshot();
        {
            let mut inner = self.ctx.cell.lock()?;
            if let Some(status) = inner.status() {
                return Err(Error::invalid_state(Operation::Create, status));
            }
            inner.slot = Slot::Live(record);
        }

        info!(id = %id, bundle = %snapshot.bundle, "container created");
        self.ctx.events.publish(TaskEvent::Created {
            id: snapshot.id.clone(),
            bundle: snapshot.bundle.clone(),
        });
        Ok(snapshot)
    }

    /// Spawns the runtime and returns the main pid.
    ///
    /// On failure the container stays `Created`.
    pub async fn start(&self) -> Result<u32> {
        let (id, bundle, runtime) = {
            let inner = self.ctx.cell.lock()?;
            let record = inner.record(Operation::Start)?;
            if record.status != ContainerStatus::Created {
                return Err(Error::invalid_state(Operation::Start, record.status));
            }
            (
                record.id.clone(),
                record.bundle_path.clone(),
                record.runtime_path.clone(),
            )
        };

        debug!(id = %id, runtime = %runtime.display(), "starting container");
        let args = RuntimeCommand::start(&id, &bundle);
        let pid = self.ctx.supervisor.spawn(&runtime, &args).inspect_err(|e| {
            warn!(id = %id, error = %e, "runtime start failed");
        })?;

        let events = self.ctx.cell.lock()?.register_main(pid)?;
        info!(id = %id, pid, "container started");
        self.ctx.publish_all(events);
        Ok(pid)
    }

    /// Stops the main process: SIGTERM, bounded wait, then SIGKILL.
    ///
    /// Idempotent: a stopped container returns its recorded exit.
    ///
    /// # Errors
    ///
    /// [`Error::TerminationFailed`] if SIGKILL could not be delivered; the
    /// record keeps its state and carries `termination_error`.
    pub async fn stop(&self) -> Result<ExitStatus> {
        let (id, pid, paused, rx) = {
            let inner = self.ctx.cell.lock()?;
            let record = inner.record(Operation::Stop)?;
            match record.status {
                ContainerStatus::Stopped => {
                    return record.exit_status().ok_or_else(|| {
                        Error::Internal("stopped container has no exit status".to_string())
                    });
                }
                ContainerStatus::Running | ContainerStatus::Paused => {}
                status => return Err(Error::invalid_state(Operation::Stop, status)),
            }
            (
                record.id.clone(),
                main_pid(record)?,
                record.status == ContainerStatus::Paused,
                inner.subscribe_main_exit(),
            )
        };

        debug!(id = %id, pid, "sending SIGTERM");
        self.ctx.signal_or_gone(pid, Signal::TERM)?;
        if paused {
            // Every frozen member gets SIGTERM, then SIGCONT so it can act on it.
            let members = self.member_pids(pid).await;
            self.signal_others(&id, pid, &members, Signal::TERM);
            for &member in &members {
                if let Err(e) = self.ctx.signal_or_gone(member, Signal::CONT) {
                    warn!(id = %id, pid = member, error = %e, "failed to thaw process for stop");
                }
            }
        }

        let exit = match wait_exit(rx.clone(), Some(self.grace_period), "stop").await {
            Ok(exit) => exit,
            Err(Error::Timeout { .. }) => {
                warn!(
                    id = %id,
                    pid,
                    grace_period = ?self.grace_period,
                    "grace period elapsed, sending SIGKILL"
                );
                if let Err(e) = self.ctx.signal_or_gone(pid, Signal::KILL) {
                    let reason = e.to_string();
                    error!(id = %id, pid, error = %reason, "forced termination failed");
                    if let Ok(mut inner) = self.ctx.cell.lock()
                        && let Ok(record) = inner.record_mut(Operation::Stop)
                    {
                        record.termination_error = Some(reason.clone());
                    }
                    return Err(Error::TerminationFailed { pid, reason });
                }
                let members = self.member_pids(pid).await;
                self.signal_others(&id, pid, &members, Signal::KILL);
                wait_exit(rx, None, "stop").await?
            }
            Err(e) => return Err(e),
        };

        info!(id = %id, pid, exit_code = exit.exit_code, "container stop complete");
        Ok(exit)
    }

    /// Freezes every process of the container.
    pub async fn pause(&self) -> Result<()> {
        let (id, pid) = {
            let inner = self.ctx.cell.lock()?;
            let record = inner.record(Operation::Pause)?;
            if record.status != ContainerStatus::Running {
                return Err(Error::invalid_state(Operation::Pause, record.status));
            }
            (record.id.clone(), main_pid(record)?)
        };

        self.signal_members(pid, Signal::STOP, Signal::CONT).await?;
        self.finish_toggle(Operation::Pause, ContainerStatus::Running, ContainerStatus::Paused)?;

        info!(id = %id, pid, "container paused");
        self.ctx.events.publish(TaskEvent::Paused { id });
        Ok(())
    }

    /// Thaws every process of the container.
    pub async fn resume(&self) -> Result<()> {
        let (id, pid) = {
            let inner = self.ctx.cell.lock()?;
            let record = inner.record(Operation::Resume)?;
            if record.status != ContainerStatus::Paused {
                return Err(Error::invalid_state(Operation::Resume, record.status));
            }
            (record.id.clone(), main_pid(record)?)
        };

        self.signal_members(pid, Signal::CONT, Signal::STOP).await?;
        self.finish_toggle(Operation::Resume, ContainerStatus::Paused, ContainerStatus::Running)?;

        info!(id = %id, pid, "container resumed");
        self.ctx.events.publish(TaskEvent::Resumed { id });
        Ok(())
    }

    /// Delivers `signal` to a process of the container.
    ///
    /// `pid == 0` addresses the main process. With `all`, every member
    /// process and live exec process receives the signal.
    pub async fn kill(&self, pid: u32, signal: Signal, all: bool) -> Result<()> {
        let (id, main, status, exec_pids) = {
            let inner = self.ctx.cell.lock()?;
            let record = inner.record(Operation::Kill)?;
            if !record.status.has_process() {
                return Err(Error::invalid_state(Operation::Kill, record.status));
            }
            (
                record.id.clone(),
                main_pid(record)?,
                record.status,
                inner.live_exec_pids(),
            )
        };

        let target = if pid == 0 { main } else { pid };
        if target == main {
            match (signal, status) {
                (Signal::STOP, ContainerStatus::Running) => return self.pause().await,
                (Signal::CONT, ContainerStatus::Paused) => return self.resume().await,
                _ => {}
            }
        }

        if all {
            let mut targets = self.member_pids(main).await;
            targets.extend(exec_pids);
            targets.sort_unstable();
            targets.dedup();
            debug!(id = %id, %signal, count = targets.len(), "signalling all processes");
            for member in targets {
                self.ctx.signal_or_gone(member, signal)?;
            }
            return Ok(());
        }

        if target != main
            && !exec_pids.contains(&target)
            && !self.member_pids(main).await.contains(&target)
        {
            return Err(Error::NoSuchProcess { pid: target });
        }

        debug!(id = %id, pid = target, %signal, "signalling process");
        self.ctx.supervisor.signal(target, signal)
    }

    /// Releases the container, stopping it and its exec sessions first.
    pub async fn delete(&self) -> Result<ContainerState> {
        let status = self.ctx.cell.lock()?.record(Operation::Delete)?.status;
        if status.has_process() {
            debug!(%status, "deleting live container, stopping first");
            self.stop().await?;
        }

        self.execs.terminate_all().await?;

        let snapshot = self.ctx.cell.lock()?.release()?;
        info!(id = %snapshot.id, "container deleted");
        self.ctx.events.publish(TaskEvent::Deleted {
            id: snapshot.id.clone(),
            pid: snapshot.pid,
            exit_code: snapshot.exit_code,
        });
        Ok(snapshot)
    }

    /// Applies resource limits to the running container.
    pub async fn update(&self, resources: &LinuxResources) -> Result<()> {
        let pid = self.live_main(Operation::Update)?;
        if resources.is_empty() {
            return Ok(());
        }
        self.ctx.resources.update(pid, resources).await
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Snapshot of the container.
    pub fn state(&self) -> Result<ContainerState> {
        self.ctx.cell.snapshot()
    }

    /// Current status, `None` before Create.
    pub fn status(&self) -> Result<Option<ContainerStatus>> {
        Ok(self.ctx.cell.lock()?.status())
    }

    /// Waits for the main process to exit.
    pub async fn wait(&self) -> Result<ExitStatus> {
        let rx = {
            let inner = self.ctx.cell.lock()?;
            let record = inner.record(Operation::Wait)?;
            match record.status {
                ContainerStatus::Stopped => {
                    return record.exit_status().ok_or_else(|| {
                        Error::Internal("stopped container has no exit status".to_string())
                    });
                }
                ContainerStatus::Running | ContainerStatus::Paused => inner.subscribe_main_exit(),
                status => return Err(Error::invalid_state(Operation::Wait, status)),
            }
        };
        wait_exit(rx, None, "wait").await
    }

    /// Resource usage of the running container.
    pub async fn stats(&self) -> Result<ContainerStats> {
        let pid = self.live_main(Operation::Stats)?;
        let exec_pids = self.ctx.cell.lock()?.live_exec_pids();

        let mut stats = self.ctx.resources.read_stats(pid).await?;
        stats.pids.push(pid);
        stats.pids.extend(exec_pids);
        stats.pids.sort_unstable();
        stats.pids.dedup();
        stats.pids_current = stats.pids_current.max(stats.pids.len() as u64);
        Ok(stats)
    }

    /// Every live process of the container, sorted.
    pub async fn list_pids(&self) -> Result<Vec<u32>> {
        let (main, exec_pids) = {
            let inner = self.ctx.cell.lock()?;
            match &inner.slot {
                Slot::Empty => return Err(Error::NotCreated),
                Slot::Deleted(_) => return Ok(Vec::new()),
                Slot::Live(record) => (
                    record.pid.filter(|_| record.status.has_process()),
                    inner.live_exec_pids(),
                ),
            }
        };

        let mut pids = match main {
            Some(pid) => self.member_pids(pid).await,
            None => Vec::new(),
        };
        pids.extend(exec_pids);
        pids.sort_unstable();
        pids.dedup();
        Ok(pids)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Main pid, requiring a state with a live process.
    fn live_main(&self, operation: Operation) -> Result<u32> {
        let inner = self.ctx.cell.lock()?;
        let record = inner.record(operation)?;
        if !record.status.has_process() {
            return Err(Error::invalid_state(operation, record.status));
        }
        main_pid(record)
    }

    /// Pids inside the resource boundary, always including `main` and never
    /// the shim itself.
    async fn member_pids(&self, main: u32) -> Vec<u32> {
        let mut pids = match self.ctx.resources.list_pids(main).await {
            Ok(pids) => pids,
            Err(e) => {
                warn!(
                    pid = main,
                    backend = self.ctx.resources.name(),
                    error = %e,
                    "failed to list container processes, using main pid only"
                );
                Vec::new()
            }
        };
        let shim = std::process::id();
        pids.retain(|&pid| pid != shim);
        pids.push(main);
        pids.sort_unstable();
        pids.dedup();
        pids
    }

    /// Best-effort delivery to every member except `main`.
    fn signal_others(&self, id: &str, main: u32, members: &[u32], signal: Signal) {
        for &member in members.iter().filter(|&&member| member != main) {
            if let Err(e) = self.ctx.signal_or_gone(member, signal) {
                warn!(id = %id, pid = member, %signal, error = %e, "failed to signal member process");
            }
        }
    }

    /// Signals all member pids; on failure the signalled ones get `undo`.
    async fn signal_members(&self, main: u32, signal: Signal, undo: Signal) -> Result<()> {
        let pids = self.member_pids(main).await;
        let mut done = Vec::with_capacity(pids.len());

        for pid in pids {
            match self.ctx.supervisor.signal(pid, signal) {
                Ok(()) => done.push(pid),
                // Members other than main may exit while we walk the list.
                Err(Error::NoSuchProcess { .. }) if pid != main => {}
                Err(e) => {
                    warn!(pid, %signal, error = %e, "signal failed, rolling back");
                    for &signalled in &done {
                        if let Err(undo_err) = self.ctx.signal_or_gone(signalled, undo) {
                            warn!(pid = signalled, error = %undo_err, "rollback signal failed");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Commits a pause/resume unless an exit was applied meanwhile.
    fn finish_toggle(
        &self,
        operation: Operation,
        from: ContainerStatus,
        to: ContainerStatus,
    ) -> Result<()> {
        let mut inner = self.ctx.cell.lock()?;
        let record = inner.record_mut(operation)?;
        if record.status != from {
            return Err(Error::invalid_state(operation, record.status));
        }
        record.status = to;
        Ok(())
    }
}

impl Drop for LifecycleStateMachine {
    fn drop(&mut self) {
        // Dropping the receiver also stops the reaper.
        self.exit_task.abort();
    }
}

fn main_pid(record: &ContainerRecord) -> Result<u32> {
    record
        .pid
        .ok_or_else(|| Error::Internal(format!("container '{}' has no pid", record.id)))
}

fn validate_bundle(bundle: &Path) -> Result<PathBuf> {
    let invalid = |reason: String| Error::InvalidBundle {
        path: bundle.to_path_buf(),
        reason,
    };

    let metadata = std::fs::metadata(bundle).map_err(|e| invalid(e.to_string()))?;
    if !metadata.is_dir() {
        return Err(invalid("not a directory".to_string()));
    }
    std::fs::canonicalize(bundle).map_err(|e| invalid(e.to_string()))
}
