//! # Task Events
//!
//! Lifecycle transitions are announced as [`TaskEvent`]s through an
//! [`EventPublisher`]. Publication is fire-and-forget: it happens after the
//! state lock is released, never blocks, and a failure to deliver never
//! rolls back the transition that produced the event.
//!
//! ## Architecture
//! ```text
//!   LifecycleStateMachine ──┐
//!   ExecRegistry ───────────┼──► EventPublisher ──► EventBus ──► subscribers
//!   exit delivery task ─────┘        │
//!                                    └──────────► TracingPublisher (log)
//! ```

use crate::constants::EVENT_BUS_CAPACITY;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Lifecycle event for the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// Container record allocated.
    Created { id: String, bundle: String },
    /// Main process started.
    Started { id: String, pid: u32 },
    /// Main process exited.
    Exited {
        id: String,
        pid: u32,
        exit_code: i32,
        exited_at: DateTime<Utc>,
    },
    /// Container frozen.
    Paused { id: String },
    /// Container thawed.
    Resumed { id: String },
    /// Exec session started.
    ExecStarted { id: String, exec_id: String, pid: u32 },
    /// Exec process exited.
    ExecExited {
        id: String,
        exec_id: String,
        pid: u32,
        exit_code: i32,
        exited_at: DateTime<Utc>,
    },
    /// Container record released.
    Deleted {
        id: String,
        pid: Option<u32>,
        exit_code: Option<i32>,
    },
}

impl TaskEvent {
    /// Topic under which the orchestrator files this event.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Created { .. } => "/tasks/create",
            Self::Started { .. } => "/tasks/start",
            Self::Exited { .. } | Self::ExecExited { .. } => "/tasks/exit",
            Self::Paused { .. } => "/tasks/paused",
            Self::Resumed { .. } => "/tasks/resumed",
            Self::ExecStarted { .. } => "/tasks/exec-started",
            Self::Deleted { .. } => "/tasks/delete",
        }
    }

    /// ID of the container the event belongs to.
    pub fn container_id(&self) -> &str {
        match self {
            Self::Created { id, .. }
            | Self::Started { id, .. }
            | Self::Exited { id, .. }
            | Self::Paused { id }
            | Self::Resumed { id }
            | Self::ExecStarted { id, .. }
            | Self::ExecExited { id, .. }
            | Self::Deleted { id, .. } => id,
        }
    }
}

/// Sink for lifecycle events.
///
/// Implementations must return promptly and must not panic; a slow or
/// absent consumer loses events rather than delaying the shim.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: TaskEvent);
}

// =============================================================================
// Implementations
// =============================================================================

/// Broadcast channel for task events.
///
/// Receivers only observe events sent after they subscribe; events are
/// dropped when nobody listens.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    /// Creates a bus with the given capacity (clamped to at least 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Creates a new independent receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BUS_CAPACITY)
    }
}

impl EventPublisher for EventBus {
    fn publish(&self, event: TaskEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!(topic = e.0.topic(), "no event subscribers, event dropped");
        }
    }
}

/// Logs every event at INFO.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPublisher;

impl EventPublisher for TracingPublisher {
    fn publish(&self, event: TaskEvent) {
        info!(
            topic = event.topic(),
            id = event.container_id(),
            event = ?event,
            "task event"
        );
    }
}

/// Fans one event out to several publishers.
#[derive(Default, Clone)]
pub struct Publishers {
    sinks: Vec<Arc<dyn EventPublisher>>,
}

impl Publishers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a publisher.
    pub fn with(mut self, sink: Arc<dyn EventPublisher>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventPublisher for Publishers {
    fn publish(&self, event: TaskEvent) {
        for sink in &self.sinks {
            sink.publish(event.clone());
        }
    }
}
