//! Resource accessor tests against fake procfs and cgroup trees.

use micashim::{CgroupV2Accessor, Error, LinuxResources, ProcfsAccessor, ResourceAccessor};
use std::path::Path;
use tempfile::TempDir;

fn write(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn fake_process(proc_root: &Path, pid: u32, ppid: u32, ticks: u64, resident_pages: u64) {
    let dir = proc_root.join(pid.to_string());
    write(
        &dir.join("stat"),
        &format!("{pid} (my proc) S {ppid} 0 0 0 0 0 0 0 0 0 {ticks} {ticks} 0 0 20 0 1 0\n"),
    );
    write(&dir.join("statm"), &format!("1000 {resident_pages} 0 0 0 0 0\n"));
}

fn sysconf(name: libc::c_int) -> u64 {
    unsafe { libc::sysconf(name) as u64 }
}

// =============================================================================
// procfs
// =============================================================================

/// 10 ─┬─ 11 ── 12
///     └─ 13
/// 20 (unrelated)
fn process_tree() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    fake_process(root, 10, 1, 50, 2);
    fake_process(root, 11, 10, 25, 1);
    fake_process(root, 12, 11, 25, 1);
    fake_process(root, 13, 10, 0, 0);
    fake_process(root, 20, 1, 100, 100);
    std::fs::create_dir(root.join("self")).unwrap();
    dir
}

#[tokio::test]
async fn test_procfs_lists_descendants() {
    let tree = process_tree();
    let accessor = ProcfsAccessor::new().with_proc_root(tree.path());

    let pids = accessor.list_pids(10).await.unwrap();
    assert_eq!(pids, vec![10, 11, 12, 13]);

    let pids = accessor.list_pids(11).await.unwrap();
    assert_eq!(pids, vec![11, 12]);
}

#[tokio::test]
async fn test_procfs_stats_aggregate_descendants() {
    let tree = process_tree();
    let accessor = ProcfsAccessor::new().with_proc_root(tree.path());

    let stats = accessor.read_stats(10).await.unwrap();
    assert_eq!(stats.pids_current, 4);
    assert_eq!(stats.memory_usage_bytes, 4 * sysconf(libc::_SC_PAGESIZE));
    assert_eq!(stats.memory_limit_bytes, None);
    // (50 + 25 + 25 + 0) ticks of user time plus the same of system time
    assert_eq!(
        stats.cpu_usage_usec,
        200 * 1_000_000 / sysconf(libc::_SC_CLK_TCK)
    );
}

#[tokio::test]
async fn test_procfs_missing_process() {
    let tree = process_tree();
    let accessor = ProcfsAccessor::new().with_proc_root(tree.path());
    assert!(matches!(
        accessor.list_pids(99).await,
        Err(Error::NoSuchProcess { pid: 99 })
    ));
}

#[tokio::test]
async fn test_procfs_update_not_supported() {
    let accessor = ProcfsAccessor::new();
    let resources = LinuxResources {
        memory_limit: Some(1 << 20),
        ..Default::default()
    };
    assert!(matches!(
        accessor.update(std::process::id(), &resources).await,
        Err(Error::NotSupported(_))
    ));
}

#[tokio::test]
async fn test_procfs_sees_real_children() {
    let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let accessor = ProcfsAccessor::new();

    let pids = accessor.list_pids(std::process::id()).await.unwrap();
    assert!(pids.contains(&child.id()));

    child.kill().unwrap();
    child.wait().unwrap();
}

// =============================================================================
// cgroup v2
// =============================================================================

struct FakeCgroup {
    _dir: TempDir,
    accessor: CgroupV2Accessor,
    group: std::path::PathBuf,
}

fn fake_cgroup() -> FakeCgroup {
    let dir = TempDir::new().unwrap();
    let proc_root = dir.path().join("proc");
    let cgroup_root = dir.path().join("cgroup");
    write(
        &proc_root.join("42").join("cgroup"),
        "0::/kubepods/pod1/c1\n",
    );

    let group = cgroup_root.join("kubepods/pod1/c1");
    write(&group.join("cgroup.procs"), "42\n43\n");
    write(&group.join("memory.current"), "8192\n");
    write(&group.join("memory.max"), "1048576\n");
    write(&group.join("pids.current"), "2\n");
    write(
        &group.join("cpu.stat"),
        "usage_usec 1500\nuser_usec 1000\nsystem_usec 500\n",
    );

    let accessor = CgroupV2Accessor::new()
        .with_root(&cgroup_root)
        .with_proc_root(&proc_root);
    FakeCgroup {
        _dir: dir,
        accessor,
        group,
    }
}

#[tokio::test]
async fn test_cgroup_dir_resolution() {
    let fake = fake_cgroup();
    assert_eq!(fake.accessor.cgroup_dir(42).await.unwrap(), fake.group);
    assert!(matches!(
        fake.accessor.cgroup_dir(7).await,
        Err(Error::Resource(_))
    ));
}

#[tokio::test]
async fn test_cgroup_stats() {
    let fake = fake_cgroup();

    assert_eq!(fake.accessor.list_pids(42).await.unwrap(), vec![42, 43]);

    let stats = fake.accessor.read_stats(42).await.unwrap();
    assert_eq!(stats.pids, vec![42, 43]);
    assert_eq!(stats.pids_current, 2);
    assert_eq!(stats.memory_usage_bytes, 8192);
    assert_eq!(stats.memory_limit_bytes, Some(1_048_576));
    assert_eq!(stats.cpu_usage_usec, 1500);
}

#[tokio::test]
async fn test_cgroup_stats_without_controllers() {
    let fake = fake_cgroup();
    for file in ["memory.current", "memory.max", "pids.current", "cpu.stat"] {
        std::fs::remove_file(fake.group.join(file)).unwrap();
    }

    let stats = fake.accessor.read_stats(42).await.unwrap();
    assert_eq!(stats.pids_current, 2);
    assert_eq!(stats.memory_usage_bytes, 0);
    assert_eq!(stats.memory_limit_bytes, None);
    assert_eq!(stats.cpu_usage_usec, 0);
}

#[tokio::test]
async fn test_cgroup_update_writes_limits() {
    let fake = fake_cgroup();
    let resources = LinuxResources {
        memory_limit: Some(64 << 20),
        cpu_quota: Some(50_000),
        cpu_period: None,
        pids_limit: Some(-1),
    };
    fake.accessor.update(42, &resources).await.unwrap();

    let read = |name: &str| std::fs::read_to_string(fake.group.join(name)).unwrap();
    assert_eq!(read("memory.max"), (64u64 << 20).to_string());
    assert_eq!(read("cpu.max"), "50000 100000");
    assert_eq!(read("pids.max"), "max");
}

#[tokio::test]
async fn test_cgroup_update_period_only() {
    let fake = fake_cgroup();
    let resources = LinuxResources {
        cpu_period: Some(200_000),
        ..Default::default()
    };
    fake.accessor.update(42, &resources).await.unwrap();

    let cpu_max = std::fs::read_to_string(fake.group.join("cpu.max")).unwrap();
    assert_eq!(cpu_max, "max 200000");
    assert!(!fake.group.join("pids.max").exists());
}

/// Shim and container main process in one cgroup: main (42) is a child of
/// the shim, and 99 is an unrelated process of the same scope.
fn shared_cgroup() -> (TempDir, CgroupV2Accessor, std::path::PathBuf) {
    let dir = TempDir::new().unwrap();
    let proc_root = dir.path().join("proc");
    let cgroup_root = dir.path().join("cgroup");
    let shim = std::process::id();

    for (pid, ppid) in [(shim, 1), (42, shim), (43, 42), (99, 1)] {
        fake_process(&proc_root, pid, ppid, 1, 1);
        write(
            &proc_root.join(pid.to_string()).join("cgroup"),
            "0::/system.slice/shim.scope\n",
        );
    }
    let scope = cgroup_root.join("system.slice/shim.scope");
    write(&scope.join("cgroup.procs"), &format!("{shim}\n42\n43\n99\n"));
    write(&scope.join("memory.current"), "999999\n");

    let accessor = CgroupV2Accessor::new()
        .with_root(&cgroup_root)
        .with_proc_root(&proc_root);
    (dir, accessor, scope)
}

#[tokio::test]
async fn test_shared_cgroup_falls_back_to_process_tree() {
    let (_dir, accessor, _) = shared_cgroup();

    assert_eq!(accessor.container_cgroup(42).await.unwrap(), None);
    assert_eq!(accessor.list_pids(42).await.unwrap(), vec![42, 43]);

    let stats = accessor.read_stats(42).await.unwrap();
    assert_eq!(stats.pids, vec![42, 43]);
    assert_eq!(stats.memory_usage_bytes, 2 * sysconf(libc::_SC_PAGESIZE));
}

#[tokio::test]
async fn test_shared_cgroup_refuses_update() {
    let (_dir, accessor, scope) = shared_cgroup();
    let resources = LinuxResources {
        memory_limit: Some(1 << 20),
        ..Default::default()
    };

    assert!(matches!(
        accessor.update(42, &resources).await,
        Err(Error::NotSupported(_))
    ));
    assert!(!scope.join("memory.max").exists());
}

#[tokio::test]
async fn test_cgroup_members_never_include_the_shim() {
    let fake = fake_cgroup();
    let shim = std::process::id();
    write(
        &fake.group.join("cgroup.procs"),
        &format!("42\n{shim}\n43\n"),
    );

    assert_eq!(fake.accessor.list_pids(42).await.unwrap(), vec![42, 43]);
    assert_eq!(fake.accessor.read_stats(42).await.unwrap().pids, vec![42, 43]);
}
