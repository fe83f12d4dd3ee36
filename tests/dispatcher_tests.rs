//! Request dispatcher tests: ordering, defaults and shutdown handling.

mod common;

use common::{Fixture, STUBBORN_RUNTIME, harness, pid_exists};
use micashim::{
    ContainerStatus, Error, Operation, Reply, Request, RequestDispatcher, ShimConfig, Signal,
};
use std::sync::Arc;
use std::time::Duration;

fn dispatcher(fixture: &Fixture, grace: Duration) -> Arc<RequestDispatcher> {
    let h = harness(grace);
    let config = ShimConfig::default()
        .with_container_id("from-config")
        .with_runtime_path(&fixture.runtime)
        .with_namespace("k8s.io");
    Arc::new(RequestDispatcher::new(h.machine, Arc::new(config)))
}

fn create(fixture: &Fixture) -> Request {
    Request::Create {
        bundle: fixture.bundle.clone(),
        runtime: None,
        id: None,
    }
}

#[tokio::test]
async fn test_create_defaults_from_config() {
    let fixture = Fixture::sleeping();
    let d = dispatcher(&fixture, Duration::from_secs(2));

    let Reply::State(state) = d.dispatch(create(&fixture)).await.unwrap() else {
        panic!("expected state reply");
    };
    assert_eq!(state.id, "from-config");
    assert_eq!(state.status, ContainerStatus::Created);
    assert_eq!(state.runtime, fixture.runtime.to_string_lossy());
}

#[tokio::test]
async fn test_full_lifecycle_through_dispatch() {
    let fixture = Fixture::sleeping();
    let d = dispatcher(&fixture, Duration::from_secs(2));

    d.dispatch(create(&fixture)).await.unwrap();
    let Reply::Started { pid } = d.dispatch(Request::Start).await.unwrap() else {
        panic!("expected started reply");
    };
    assert!(pid_exists(pid));

    assert_eq!(d.dispatch(Request::Pause).await.unwrap(), Reply::Done);
    assert_eq!(d.dispatch(Request::Resume).await.unwrap(), Reply::Done);

    let Reply::Pids { pids } = d.dispatch(Request::ListPids).await.unwrap() else {
        panic!("expected pids reply");
    };
    assert!(pids.contains(&pid));

    let Reply::Exit(exit) = d.dispatch(Request::Stop).await.unwrap() else {
        panic!("expected exit reply");
    };
    assert_eq!(exit.exit_code, 143);

    let Reply::State(state) = d.dispatch(Request::Delete).await.unwrap() else {
        panic!("expected state reply");
    };
    assert_eq!(state.status, ContainerStatus::Deleted);
    assert_eq!(state.exit_code, Some(143));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queries_not_blocked_by_stop() {
    let fixture = Fixture::new(STUBBORN_RUNTIME);
    let d = dispatcher(&fixture, Duration::from_secs(1));
    d.dispatch(create(&fixture)).await.unwrap();
    d.dispatch(Request::Start).await.unwrap();

    let stopping = {
        let d = Arc::clone(&d);
        tokio::spawn(async move { d.dispatch(Request::Stop).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Stop is inside its grace period; the query answers at once.
    let reply = tokio::time::timeout(Duration::from_millis(300), d.dispatch(Request::State))
        .await
        .expect("state query blocked behind stop")
        .unwrap();
    let Reply::State(state) = reply else {
        panic!("expected state reply");
    };
    assert_eq!(state.status, ContainerStatus::Running);

    let Reply::Exit(exit) = stopping.await.unwrap().unwrap() else {
        panic!("expected exit reply");
    };
    assert_eq!(exit.exit_code, 137);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mutations_run_in_order() {
    let fixture = Fixture::new(STUBBORN_RUNTIME);
    let d = dispatcher(&fixture, Duration::from_millis(500));
    d.dispatch(create(&fixture)).await.unwrap();
    d.dispatch(Request::Start).await.unwrap();

    let stopping = {
        let d = Arc::clone(&d);
        tokio::spawn(async move { d.dispatch(Request::Stop).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Pause queues behind the stop and then finds the container stopped.
    let err = d.dispatch(Request::Pause).await.unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidState {
            operation: Operation::Pause,
            state: ContainerStatus::Stopped,
        }
    ));
    assert!(stopping.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_shutdown_refused_while_live() {
    let fixture = Fixture::sleeping();
    let d = dispatcher(&fixture, Duration::from_secs(2));
    let shutdown = d.shutdown_requested();

    d.dispatch(create(&fixture)).await.unwrap();
    d.dispatch(Request::Start).await.unwrap();
    let err = d.dispatch(Request::Shutdown).await.unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidState {
            operation: Operation::Shutdown,
            state: ContainerStatus::Running,
        }
    ));
    assert!(!*shutdown.borrow());

    d.dispatch(Request::Kill {
        pid: 0,
        signal: Signal::KILL,
        all: false,
    })
    .await
    .unwrap();
    d.dispatch(Request::Wait).await.unwrap();

    assert_eq!(d.dispatch(Request::Shutdown).await.unwrap(), Reply::Done);
    assert!(*shutdown.borrow());
}

#[tokio::test]
async fn test_shutdown_before_create() {
    let fixture = Fixture::sleeping();
    let d = dispatcher(&fixture, Duration::from_secs(2));
    let mut shutdown = d.shutdown_requested();

    assert_eq!(d.dispatch(Request::Shutdown).await.unwrap(), Reply::Done);
    tokio::time::timeout(Duration::from_secs(1), shutdown.wait_for(|v| *v))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_teardown_deletes_live_container() {
    let fixture = Fixture::sleeping();
    let d = dispatcher(&fixture, Duration::from_secs(2));
    d.dispatch(create(&fixture)).await.unwrap();
    let Reply::Started { pid } = d.dispatch(Request::Start).await.unwrap() else {
        panic!("expected started reply");
    };

    d.teardown().await.unwrap();
    assert!(!pid_exists(pid));
    assert_eq!(
        d.machine().status().unwrap(),
        Some(ContainerStatus::Deleted)
    );

    // Nothing left to tear down.
    d.teardown().await.unwrap();
}

#[tokio::test]
async fn test_ping_reports_shim_identity() {
    let fixture = Fixture::sleeping();
    let d = dispatcher(&fixture, Duration::from_secs(2));

    let Reply::Pong(info) = d.dispatch(Request::Ping).await.unwrap() else {
        panic!("expected pong");
    };
    assert_eq!(info.shim_pid, std::process::id());
    assert_eq!(info.namespace, "k8s.io");
    assert_eq!(info.container_pid, None);

    d.dispatch(create(&fixture)).await.unwrap();
    let Reply::Started { pid } = d.dispatch(Request::Start).await.unwrap() else {
        panic!("expected started reply");
    };
    let Reply::Pong(info) = d.dispatch(Request::Ping).await.unwrap() else {
        panic!("expected pong");
    };
    assert_eq!(info.container_pid, Some(pid));
    d.teardown().await.unwrap();
}

#[tokio::test]
async fn test_exec_through_dispatch() {
    let fixture = Fixture::sleeping();
    let d = dispatcher(&fixture, Duration::from_secs(2));
    d.dispatch(create(&fixture)).await.unwrap();
    d.dispatch(Request::Start).await.unwrap();

    let request = Request::Exec {
        exec_id: "e1".into(),
        command: vec!["sleep".into(), "30".into()],
    };
    let Reply::Exec(state) = d.dispatch(request).await.unwrap() else {
        panic!("expected exec reply");
    };
    assert_eq!(state.exec_id, "e1");

    d.dispatch(Request::KillExec {
        exec_id: "e1".into(),
        signal: Signal::TERM,
    })
    .await
    .unwrap();
    let Reply::Exit(exit) = d
        .dispatch(Request::WaitExec {
            exec_id: "e1".into(),
        })
        .await
        .unwrap()
    else {
        panic!("expected exit reply");
    };
    assert_eq!(exit.exit_code, 143);
    d.teardown().await.unwrap();
}

#[test]
fn test_request_classification() {
    assert!(Request::Stop.is_mutating());
    assert!(Request::Shutdown.is_mutating());
    assert!(!Request::State.is_mutating());
    assert!(
        !Request::WaitExec {
            exec_id: "e".into()
        }
        .is_mutating()
    );
    assert_eq!(Request::ListPids.action(), "list_pids");
}
