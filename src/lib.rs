//! # micashim
//!
//! **Per-Container Shim for OCI Runtimes**
//!
//! A long-lived supervisor that sits between a container orchestrator and an
//! OCI-compatible runtime binary. It owns exactly one container, translates
//! lifecycle requests into process spawns, signals and reaps, and keeps an
//! authoritative view of the container's state under concurrent requests.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                             micashim                                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ControlServer (Unix socket, JSON lines)                            │
//! │        │                                                            │
//! │        ▼                                                            │
//! │  RequestDispatcher ── mutations serialized, queries concurrent      │
//! │        │                                                            │
//! │        ├────────────► LifecycleStateMachine ◄── exit delivery ──┐   │
//! │        │                     │        │                         │   │
//! │        └────────────► ExecRegistry    └─► ResourceAccessor      │   │
//! │                              │            (cgroup v2 / procfs)  │   │
//! │                              ▼                                  │   │
//! │                      ProcessSupervisor ── reaper ───────────────┘   │
//! │                       spawn │ signal                                │
//! ├─────────────────────────────┼───────────────────────────────────────┤
//! │                             ▼                                       │
//! │              <runtime> start <id> <bundle>                          │
//! │              <runtime> exec <id> <command...>                       │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! ```text
//!   (none) ─create─► Created ─start─► Running ⇄ Paused
//!                       │                │        │
//!                       │             stop/exit   │
//!                       │                ▼        │
//!                       └──delete──► Stopped ◄────┘
//!                                        │
//!                                     delete
//!                                        ▼
//!                                     Deleted
//! ```
//!
//! Invalid operations fail with [`Error::InvalidState`] and leave the record
//! untouched. A failed start leaves the container `Created`.
//!
//! # Concurrency Model
//!
//! - Mutating requests run one at a time in arrival order
//! - Queries read a snapshot under a short lock and never wait for mutations
//! - The reaper runs in the background; only exit delivery moves the main
//!   process into `Stopped`, so a stop racing a natural exit records one exit
//!
//! # Example
//!
//! ```rust,ignore
//! use micashim::{LifecycleStateMachine, NativeSupervisor, RequestDispatcher, Request, ShimConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> micashim::Result<()> {
//!     let (supervisor, exits) = NativeSupervisor::new();
//!     let machine = LifecycleStateMachine::builder(Arc::new(supervisor), exits).build();
//!     let dispatcher = RequestDispatcher::new(machine, Arc::new(ShimConfig::default()));
//!
//!     dispatcher
//!         .dispatch(Request::Create { bundle: "/run/bundle".into(), runtime: None, id: None })
//!         .await?;
//!     dispatcher.dispatch(Request::Start).await?;
//!     Ok(())
//! }
//! ```

#[cfg(not(unix))]
compile_error!("micashim supervises processes with Unix signals and requires a Unix target");

pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod exec;
pub mod lifecycle;
pub mod protocol;
pub mod resources;
pub mod runtime;
pub mod server;
pub mod state;
pub mod supervisor;

// Re-exports
pub use config::ShimConfig;
pub use constants::*;
pub use dispatcher::{Reply, Request, RequestDispatcher, ShimInfo};
pub use error::{Error, Result, SpawnError};
pub use events::{EventBus, EventPublisher, Publishers, TaskEvent, TracingPublisher};
pub use exec::ExecRegistry;
pub use lifecycle::{LifecycleBuilder, LifecycleStateMachine};
pub use protocol::{ErrorCode, Response};
pub use resources::{
    CgroupV2Accessor, ContainerStats, LinuxResources, ProcfsAccessor, ResourceAccessor,
};
pub use runtime::{
    ContainerState, ContainerStatus, ExecState, ExecStatus, ExitStatus, MAX_SIGNAL, Operation,
    Signal,
};
pub use server::ControlServer;
pub use state::{ContainerCell, ContainerRecord, ExecSession};
pub use supervisor::{ExitEvent, ExitReceiver, NativeSupervisor, ProcessSupervisor};
