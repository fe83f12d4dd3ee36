//! # Request Dispatcher
//!
//! Concurrency boundary between the control channel and the lifecycle
//! engine.
//!
//! ## Ordering
//!
//! ```text
//!   mutating ───► tokio::sync::Mutex<()> (FIFO) ───► LifecycleStateMachine
//!   read-only ─────────────────────────────────────► (snapshot under cell lock)
//! ```
//!
//! Mutating requests (create, start, stop, pause, resume, delete, exec,
//! update, kill, shutdown) hold the dispatch lock for their whole duration.
//! Tokio's mutex grants the lock in request order, so mutations run one at
//! a time in arrival order. Read-only requests never take it and are not
//! queued behind a stop waiting out its grace period.

use crate::config::ShimConfig;
use crate::error::{Error, Result};
use crate::lifecycle::LifecycleStateMachine;
use crate::resources::{ContainerStats, LinuxResources};
use crate::runtime::{ContainerState, ContainerStatus, ExecState, ExitStatus, Operation, Signal};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

// =============================================================================
// Requests
// =============================================================================

/// A lifecycle request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    /// Allocate the container. `id` and `runtime` default to the shim config.
    Create {
        bundle: PathBuf,
        #[serde(default)]
        runtime: Option<PathBuf>,
        #[serde(default)]
        id: Option<String>,
    },
    Start,
    Stop,
    Pause,
    Resume,
    Delete,
    /// Signal a process; `pid` 0 is the main process.
    Kill {
        #[serde(default)]
        pid: u32,
        signal: Signal,
        #[serde(default)]
        all: bool,
    },
    Exec {
        exec_id: String,
        command: Vec<String>,
    },
    Update {
        resources: LinuxResources,
    },
    Shutdown,

    State,
    Stats,
    ListPids,
    Wait,
    ExecState {
        exec_id: String,
    },
    KillExec {
        exec_id: String,
        signal: Signal,
    },
    WaitExec {
        exec_id: String,
    },
    Ping,
}

impl Request {
    /// Returns true if the request must be serialized against other mutations.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::Create { .. }
                | Self::Start
                | Self::Stop
                | Self::Pause
                | Self::Resume
                | Self::Delete
                | Self::Kill { .. }
                | Self::Exec { .. }
                | Self::Update { .. }
                | Self::Shutdown
        )
    }

    /// Action name as it appears on the wire.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Delete => "delete",
            Self::Kill { .. } => "kill",
            Self::Exec { .. } => "exec",
            Self::Update { .. } => "update",
            Self::Shutdown => "shutdown",
            Self::State => "state",
            Self::Stats => "stats",
            Self::ListPids => "list_pids",
            Self::Wait => "wait",
            Self::ExecState { .. } => "exec_state",
            Self::KillExec { .. } => "kill_exec",
            Self::WaitExec { .. } => "wait_exec",
            Self::Ping => "ping",
        }
    }
}

// =============================================================================
// Replies
// =============================================================================

/// Shim identity returned by `Ping`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShimInfo {
    pub shim_pid: u32,
    pub version: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_pid: Option<u32>,
}

/// Result of a dispatched request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    State(ContainerState),
    Started { pid: u32 },
    Exit(ExitStatus),
    Exec(ExecState),
    Pids { pids: Vec<u32> },
    Stats(ContainerStats),
    Pong(ShimInfo),
    Done,
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Serializes mutating requests against the lifecycle engine.
pub struct RequestDispatcher {
    machine: LifecycleStateMachine,
    config: Arc<ShimConfig>,
    mutations: Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl RequestDispatcher {
    pub fn new(machine: LifecycleStateMachine, config: Arc<ShimConfig>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            machine,
            config,
            mutations: Mutex::new(()),
            shutdown,
        }
    }

    pub fn machine(&self) -> &LifecycleStateMachine {
        &self.machine
    }

    /// Receiver that flips to `true` once a shutdown was accepted.
    pub fn shutdown_requested(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Executes one request.
    pub async fn dispatch(&self, request: Request) -> Result<Reply> {
        debug!(action = request.action(), "dispatching request");
        if request.is_mutating() {
            let _guard = self.mutations.lock().await;
            self.execute(request).await
        } else {
            self.execute(request).await
        }
    }

    /// Stops and deletes a live container before the shim exits.
    pub async fn teardown(&self) -> Result<()> {
        let _guard = self.mutations.lock().await;
        match self.machine.status()? {
            None | Some(ContainerStatus::Deleted) => Ok(()),
            Some(status) => {
                info!(%status, "tearing down container");
                self.machine.delete().await.map(|_| ())
            }
        }
    }

    async fn execute(&self, request: Request) -> Result<Reply> {
        let machine = &self.machine;
        let execs = machine.execs();

        match request {
            Request::Create { bundle, runtime, id } => {
                let id = id.unwrap_or_else(|| self.config.container_id.clone());
                let runtime = runtime.unwrap_or_else(|| self.config.runtime_path.clone());
                machine.create(&id, &bundle, &runtime).await.map(Reply::State)
            }
            Request::Start => machine.start().await.map(|pid| Reply::Started { pid }),
            Request::Stop => machine.stop().await.map(Reply::Exit),
            Request::Pause => machine.pause().await.map(|()| Reply::Done),
            Request::Resume => machine.resume().await.map(|()| Reply::Done),
            Request::Delete => machine.delete().await.map(Reply::State),
            Request::Kill { pid, signal, all } => {
                machine.kill(pid, signal, all).await.map(|()| Reply::Done)
            }
            Request::Exec { exec_id, command } => execs.exec(&exec_id, command).await.map(Reply::Exec),
            Request::Update { resources } => machine.update(&resources).await.map(|()| Reply::Done),
            Request::Shutdown => self.accept_shutdown(),

            Request::State => machine.state().map(Reply::State),
            Request::Stats => machine.stats().await.map(Reply::Stats),
            Request::ListPids => machine.list_pids().await.map(|pids| Reply::Pids { pids }),
            Request::Wait => machine.wait().await.map(Reply::Exit),
            Request::ExecState { exec_id } => execs.exec_state(&exec_id).map(Reply::Exec),
            Request::KillExec { exec_id, signal } => {
                execs.kill_exec(&exec_id, signal).await.map(|()| Reply::Done)
            }
            Request::WaitExec { exec_id } => execs.wait_exec(&exec_id).await.map(Reply::Exit),
            Request::Ping => Ok(Reply::Pong(self.info())),
        }
    }

    fn accept_shutdown(&self) -> Result<Reply> {
        if let Some(status) = self.machine.status()?
            && status.has_process()
        {
            warn!(%status, "shutdown refused while container is live");
            return Err(Error::invalid_state(Operation::Shutdown, status));
        }
        info!("shutdown requested");
        self.shutdown.send_replace(true);
        Ok(Reply::Done)
    }

    fn info(&self) -> ShimInfo {
        let container_pid = self
            .machine
            .state()
            .ok()
            .and_then(|s| s.pid.filter(|_| s.status.has_process()));
        ShimInfo {
            shim_pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            namespace: self.config.namespace.clone(),
            container_pid,
        }
    }
}
