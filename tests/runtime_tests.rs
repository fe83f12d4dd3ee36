//! Tests for container state types and signal handling.

use micashim::{ContainerState, ContainerStatus, ExecStatus, ExitStatus, MAX_SIGNAL, Signal};

// =============================================================================
// ContainerStatus Tests
// =============================================================================

#[test]
fn test_container_status_display() {
    assert_eq!(ContainerStatus::Created.to_string(), "created");
    assert_eq!(ContainerStatus::Running.to_string(), "running");
    assert_eq!(ContainerStatus::Paused.to_string(), "paused");
    assert_eq!(ContainerStatus::Stopped.to_string(), "stopped");
    assert_eq!(ContainerStatus::Deleted.to_string(), "deleted");
}

#[test]
fn test_container_status_serialization() {
    let json = serde_json::to_string(&ContainerStatus::Paused).unwrap();
    assert_eq!(json, "\"paused\"");

    let status: ContainerStatus = serde_json::from_str("\"stopped\"").unwrap();
    assert_eq!(status, ContainerStatus::Stopped);
}

#[test]
fn test_only_running_and_paused_have_process() {
    let live: Vec<_> = [
        ContainerStatus::Created,
        ContainerStatus::Running,
        ContainerStatus::Paused,
        ContainerStatus::Stopped,
        ContainerStatus::Deleted,
    ]
    .into_iter()
    .filter(ContainerStatus::has_process)
    .collect();
    assert_eq!(live, vec![ContainerStatus::Running, ContainerStatus::Paused]);
}

#[test]
fn test_exec_status_display() {
    assert_eq!(ExecStatus::Running.to_string(), "running");
    assert_eq!(ExecStatus::Exited.to_string(), "exited");
}

// =============================================================================
// ContainerState Tests
// =============================================================================

#[test]
fn test_container_state_json_shape() {
    let json = r#"{
        "ociVersion": "1.0.2",
        "id": "c1",
        "status": "stopped",
        "pid": 1234,
        "bundle": "/run/bundle",
        "runtime": "/usr/bin/runtime",
        "exitCode": 143,
        "exitedAt": "2024-01-01T00:00:05Z",
        "createdAt": "2024-01-01T00:00:00Z",
        "startedAt": "2024-01-01T00:00:01Z"
    }"#;
    let state: ContainerState = serde_json::from_str(json).unwrap();
    assert_eq!(state.id, "c1");
    assert_eq!(state.status, ContainerStatus::Stopped);
    assert_eq!(state.pid, Some(1234));
    assert_eq!(state.exit_code, Some(143));
    assert!(state.termination_error.is_none());
    assert!(!state.is_running());

    let value = serde_json::to_value(&state).unwrap();
    assert_eq!(value["exitCode"], 143);
    assert!(value.get("terminationError").is_none());
}

#[test]
fn test_created_state_omits_process_fields() {
    let json = r#"{
        "ociVersion": "1.0.2",
        "id": "c1",
        "status": "created",
        "bundle": "/run/bundle",
        "runtime": "/usr/bin/runtime",
        "createdAt": "2024-01-01T00:00:00Z"
    }"#;
    let state: ContainerState = serde_json::from_str(json).unwrap();
    let value = serde_json::to_value(&state).unwrap();
    assert!(value.get("pid").is_none());
    assert!(value.get("exitCode").is_none());
    assert!(value.get("startedAt").is_none());
}

#[test]
fn test_exit_status_json() {
    let exit: ExitStatus =
        serde_json::from_str(r#"{"exit_code":137,"exited_at":"2024-01-01T00:00:00Z"}"#).unwrap();
    assert_eq!(exit.exit_code, 137);
}

// =============================================================================
// Signal Tests
// =============================================================================

#[test]
fn test_signal_numbers() {
    assert_eq!(Signal::TERM.as_i32(), 15);
    assert_eq!(Signal::KILL.as_i32(), 9);
    assert_eq!(Signal::HUP.as_i32(), 1);
    assert_eq!(Signal::INT.as_i32(), 2);
    assert_eq!(Signal::STOP.as_i32(), libc::SIGSTOP);
    assert_eq!(Signal::CONT.as_i32(), libc::SIGCONT);
}

#[test]
fn test_signal_display() {
    assert_eq!(Signal::TERM.to_string(), "SIGTERM");
    assert_eq!(Signal::USR1.to_string(), "SIGUSR1");
}

#[test]
fn test_signal_deserialize_number_or_name() {
    let by_number: Signal = serde_json::from_str("9").unwrap();
    assert_eq!(by_number, Signal::KILL);

    let by_name: Signal = serde_json::from_str("\"SIGSTOP\"").unwrap();
    assert_eq!(by_name, Signal::STOP);

    let short: Signal = serde_json::from_str("\"cont\"").unwrap();
    assert_eq!(short, Signal::CONT);

    assert!(serde_json::from_str::<Signal>("\"SIGBOGUS\"").is_err());
    assert!(serde_json::from_str::<Signal>("0").is_err());
    assert!(serde_json::from_str::<Signal>("65").is_err());
}

#[test]
fn test_signal_accepts_any_valid_number() {
    for signo in [libc::SIGALRM, libc::SIGWINCH, 34, MAX_SIGNAL] {
        let signal: Signal = serde_json::from_str(&signo.to_string()).unwrap();
        assert_eq!(signal.as_i32(), signo);
    }

    let kill: micashim::Request =
        serde_json::from_str(r#"{"action":"kill","pid":0,"signal":28}"#).unwrap();
    assert!(matches!(kill, micashim::Request::Kill { signal, .. } if signal.as_i32() == 28));
}

#[test]
fn test_signal_serializes_as_name() {
    assert_eq!(serde_json::to_string(&Signal::TERM).unwrap(), "\"SIGTERM\"");
    let realtime = Signal::from_raw(40).unwrap();
    assert_eq!(serde_json::to_string(&realtime).unwrap(), "40");
}
