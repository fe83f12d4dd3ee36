//! Shared fixtures: fake runtime scripts, bundles and test doubles.

#![allow(dead_code)]

use async_trait::async_trait;
use micashim::{
    ContainerStats, EventPublisher, LifecycleStateMachine, LinuxResources, NativeSupervisor,
    ResourceAccessor, TaskEvent,
};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Runtime whose main process sleeps and whose exec runs the command.
pub const SLEEPING_RUNTIME: &str = r#"#!/bin/sh
case "$1" in
  start) exec sleep 30 ;;
  exec) shift 2; exec "$@" ;;
  *) exit 64 ;;
esac
"#;

/// Runtime whose main process ignores SIGTERM.
pub const STUBBORN_RUNTIME: &str = r#"#!/bin/sh
case "$1" in
  start) trap '' TERM; exec sleep 30 ;;
  exec) shift 2; exec "$@" ;;
  *) exit 64 ;;
esac
"#;

/// Runtime whose main process exits immediately with `code`.
pub fn exiting_runtime(code: i32) -> String {
    format!("#!/bin/sh\ncase \"$1\" in\n  start) exit {code} ;;\n  *) exit 64 ;;\nesac\n")
}

/// Temporary bundle directory plus runtime script.
pub struct Fixture {
    pub dir: TempDir,
    pub bundle: PathBuf,
    pub runtime: PathBuf,
}

impl Fixture {
    pub fn new(script: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join("bundle");
        std::fs::create_dir(&bundle).unwrap();
        std::fs::write(bundle.join("config.json"), "{}").unwrap();

        let runtime = dir.path().join("runtime");
        write_script(&runtime, script);
        Self {
            dir,
            bundle,
            runtime,
        }
    }

    pub fn sleeping() -> Self {
        Self::new(SLEEPING_RUNTIME)
    }

    /// Removes the exec bits from the runtime script.
    pub fn make_runtime_non_executable(&self) {
        std::fs::set_permissions(&self.runtime, std::fs::Permissions::from_mode(0o644)).unwrap();
    }
}

pub fn write_script(path: &Path, script: &str) {
    std::fs::write(path, script).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

// =============================================================================
// Test Doubles
// =============================================================================

/// Accessor reporting a fixed set of extra pids.
#[derive(Default)]
pub struct FakeAccessor {
    pub extra_pids: Mutex<Vec<u32>>,
    pub updates: Mutex<Vec<LinuxResources>>,
}

#[async_trait]
impl ResourceAccessor for FakeAccessor {
    async fn list_pids(&self, main_pid: u32) -> micashim::Result<Vec<u32>> {
        let mut pids = self.extra_pids.lock().unwrap().clone();
        pids.push(main_pid);
        Ok(pids)
    }

    async fn read_stats(&self, main_pid: u32) -> micashim::Result<ContainerStats> {
        Ok(ContainerStats {
            pids: vec![main_pid],
            pids_current: 1,
            memory_usage_bytes: 4096,
            memory_limit_bytes: Some(1 << 20),
            cpu_usage_usec: 10,
        })
    }

    async fn update(&self, _main_pid: u32, resources: &LinuxResources) -> micashim::Result<()> {
        self.updates.lock().unwrap().push(resources.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Publisher that records every event.
#[derive(Default)]
pub struct RecordingPublisher {
    pub events: Mutex<Vec<TaskEvent>>,
}

impl RecordingPublisher {
    pub fn topics(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.topic()).collect()
    }

    pub fn count(&self, topic: &str) -> usize {
        self.topics().iter().filter(|t| **t == topic).count()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: TaskEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// State machine wired to a real supervisor and the test doubles.
pub struct Harness {
    pub machine: LifecycleStateMachine,
    pub accessor: Arc<FakeAccessor>,
    pub events: Arc<RecordingPublisher>,
}

pub fn harness(grace_period: Duration) -> Harness {
    let (supervisor, exits) = NativeSupervisor::new();
    let accessor = Arc::new(FakeAccessor::default());
    let events = Arc::new(RecordingPublisher::default());
    let machine = LifecycleStateMachine::builder(Arc::new(supervisor), exits)
        .resources(accessor.clone())
        .events(events.clone())
        .grace_period(grace_period)
        .build();
    Harness {
        machine,
        accessor,
        events,
    }
}

// =============================================================================
// Process Helpers
// =============================================================================

/// Returns true if `pid` exists (including zombies).
pub fn pid_exists(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Process state letter from `/proc/<pid>/stat` (`T` = stopped).
pub fn proc_state(pid: u32) -> Option<char> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().next()?.chars().next()
}

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
