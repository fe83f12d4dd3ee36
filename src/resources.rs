//! # Resource Accessors
//!
//! The lifecycle engine never reads cgroup files itself. It asks a
//! [`ResourceAccessor`] which processes belong to the container, how much
//! they consume, and to apply new limits.
//!
//! | Backend | Member pids | Stats | Update |
//! |---------|-------------|-------|--------|
//! | [`CgroupV2Accessor`] | `cgroup.procs` | memory, pids, cpu | `memory.max`, `cpu.max`, `pids.max` |
//! | [`ProcfsAccessor`] | descendants via `/proc/*/stat` | RSS, cpu time | not supported |
//!
//! [`detect`] picks cgroup v2 when the unified hierarchy is mounted.
//!
//! The runtime process inherits the shim's cgroup until the runtime moves the
//! container into its own. While the two cgroups are the same, the cgroup
//! accessor answers from the process tree instead and refuses `Update`, so
//! the shim never signals or limits itself.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Default mount point of the unified cgroup hierarchy.
pub const CGROUP_V2_ROOT: &str = "/sys/fs/cgroup";

/// Default CFS period when only a quota is given (100ms).
pub const DEFAULT_CPU_PERIOD: u64 = 100_000;

// =============================================================================
// Types
// =============================================================================

/// Resource limits applied by `Update`.
///
/// `None` leaves a limit unchanged; a non-positive value removes it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinuxResources {
    /// Memory limit in bytes.
    #[serde(default)]
    pub memory_limit: Option<i64>,
    /// CPU quota in microseconds per period.
    #[serde(default)]
    pub cpu_quota: Option<i64>,
    /// CPU period in microseconds.
    #[serde(default)]
    pub cpu_period: Option<u64>,
    /// Maximum number of processes.
    #[serde(default)]
    pub pids_limit: Option<i64>,
}

impl LinuxResources {
    /// Returns true if no limit is set.
    pub fn is_empty(&self) -> bool {
        self.memory_limit.is_none()
            && self.cpu_quota.is_none()
            && self.cpu_period.is_none()
            && self.pids_limit.is_none()
    }
}

/// Resource usage of the container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStats {
    /// Member processes.
    pub pids: Vec<u32>,
    /// Number of member processes.
    pub pids_current: u64,
    /// Memory in use, bytes.
    pub memory_usage_bytes: u64,
    /// Memory limit, bytes (`None` = unlimited or unknown).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit_bytes: Option<u64>,
    /// Cumulative CPU time, microseconds.
    pub cpu_usage_usec: u64,
}

/// Access to the container's resource boundary.
///
/// All methods take the main pid; implementations locate the boundary from it.
#[async_trait]
pub trait ResourceAccessor: Send + Sync {
    /// Lists every process inside the boundary.
    async fn list_pids(&self, main_pid: u32) -> Result<Vec<u32>>;

    /// Reads resource usage.
    async fn read_stats(&self, main_pid: u32) -> Result<ContainerStats>;

    /// Applies resource limits.
    async fn update(&self, main_pid: u32, resources: &LinuxResources) -> Result<()>;

    /// Backend name for logging.
    fn name(&self) -> &'static str;
}

/// Picks the accessor for this host.
pub fn detect() -> Arc<dyn ResourceAccessor> {
    if Path::new(CGROUP_V2_ROOT).join("cgroup.controllers").exists() {
        info!("using cgroup v2 resource accessor");
        Arc::new(CgroupV2Accessor::new())
    } else {
        info!("cgroup v2 not mounted, using procfs resource accessor");
        Arc::new(ProcfsAccessor::new())
    }
}

// =============================================================================
// cgroup v2
// =============================================================================

/// Accessor for the unified cgroup hierarchy.
#[derive(Debug, Clone)]
pub struct CgroupV2Accessor {
    root: PathBuf,
    proc_root: PathBuf,
    shim_pid: u32,
    tree: ProcfsAccessor,
}

impl CgroupV2Accessor {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from(CGROUP_V2_ROOT),
            proc_root: PathBuf::from("/proc"),
            shim_pid: std::process::id(),
            tree: ProcfsAccessor::new(),
        }
    }

    /// Uses a different cgroup mount point.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Uses a different procfs mount point for cgroup membership lookups.
    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self.tree = ProcfsAccessor::new().with_proc_root(&self.proc_root);
        self
    }

    /// Resolves the cgroup directory of `pid`.
    pub async fn cgroup_dir(&self, pid: u32) -> Result<PathBuf> {
        let path = self.proc_root.join(pid.to_string()).join("cgroup");
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::Resource(format!("read {}: {e}", path.display())))?;
        let relative = parse_unified_cgroup(&content).ok_or_else(|| {
            Error::Resource(format!("process {pid} is not in a cgroup v2 hierarchy"))
        })?;
        Ok(self.root.join(relative.trim_start_matches('/')))
    }

    /// Resolves the container's own cgroup.
    ///
    /// Returns `None` while `main_pid` still shares the shim's cgroup.
    pub async fn container_cgroup(&self, main_pid: u32) -> Result<Option<PathBuf>> {
        let dir = self.cgroup_dir(main_pid).await?;
        match self.cgroup_dir(self.shim_pid).await {
            Ok(own) if own == dir => {
                debug!(pid = main_pid, cgroup = %dir.display(), "container shares the shim cgroup");
                Ok(None)
            }
            _ => Ok(Some(dir)),
        }
    }

    async fn read_file(dir: &Path, name: &str) -> Result<String> {
        let path = dir.join(name);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::Resource(format!("read {}: {e}", path.display())))
    }

    async fn write_file(dir: &Path, name: &str, value: &str) -> Result<()> {
        let path = dir.join(name);
        debug!(path = %path.display(), value, "writing cgroup limit");
        tokio::fs::write(&path, value)
            .await
            .map_err(|e| Error::Resource(format!("write {}: {e}", path.display())))
    }
}

impl Default for CgroupV2Accessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceAccessor for CgroupV2Accessor {
    async fn list_pids(&self, main_pid: u32) -> Result<Vec<u32>> {
        let Some(dir) = self.container_cgroup(main_pid).await? else {
            return self.tree.list_pids(main_pid).await;
        };
        let mut pids = parse_pid_list(&Self::read_file(&dir, "cgroup.procs").await?);
        pids.retain(|&pid| pid != self.shim_pid);
        Ok(pids)
    }

    async fn read_stats(&self, main_pid: u32) -> Result<ContainerStats> {
        let Some(dir) = self.container_cgroup(main_pid).await? else {
            return self.tree.read_stats(main_pid).await;
        };
        let mut pids = parse_pid_list(&Self::read_file(&dir, "cgroup.procs").await?);
        pids.retain(|&pid| pid != self.shim_pid);

        // Controllers may be disabled for this cgroup; missing files read as zero.
        let memory_usage_bytes = Self::read_file(&dir, "memory.current")
            .await
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);
        let memory_limit_bytes = Self::read_file(&dir, "memory.max")
            .await
            .ok()
            .and_then(|s| parse_max(&s));
        let pids_current = Self::read_file(&dir, "pids.current")
            .await
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(pids.len() as u64);
        let cpu_usage_usec = Self::read_file(&dir, "cpu.stat")
            .await
            .ok()
            .and_then(|s| parse_cpu_usage(&s))
            .unwrap_or(0);

        Ok(ContainerStats {
            pids,
            pids_current,
            memory_usage_bytes,
            memory_limit_bytes,
            cpu_usage_usec,
        })
    }

    async fn update(&self, main_pid: u32, resources: &LinuxResources) -> Result<()> {
        let Some(dir) = self.container_cgroup(main_pid).await? else {
            return Err(Error::NotSupported(format!(
                "process {main_pid} has no cgroup of its own"
            )));
        };

        if let Some(limit) = resources.memory_limit {
            Self::write_file(&dir, "memory.max", &limit_value(limit)).await?;
        }
        if resources.cpu_quota.is_some() || resources.cpu_period.is_some() {
            let quota = resources.cpu_quota.map_or("max".to_string(), limit_value);
            let period = resources.cpu_period.unwrap_or(DEFAULT_CPU_PERIOD);
            Self::write_file(&dir, "cpu.max", &format!("{quota} {period}")).await?;
        }
        if let Some(limit) = resources.pids_limit {
            Self::write_file(&dir, "pids.max", &limit_value(limit)).await?;
        }

        info!(pid = main_pid, cgroup = %dir.display(), "updated resource limits");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "cgroup-v2"
    }
}

/// Extracts the unified hierarchy path from `/proc/<pid>/cgroup`.
pub fn parse_unified_cgroup(content: &str) -> Option<&str> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(str::trim)
}

/// Parses a cgroup limit file where `max` means unlimited.
pub fn parse_max(content: &str) -> Option<u64> {
    match content.trim() {
        "max" => None,
        v => v.parse().ok(),
    }
}

/// Reads `usage_usec` from `cpu.stat`.
pub fn parse_cpu_usage(content: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let (key, value) = line.split_once(' ')?;
        (key == "usage_usec").then(|| value.trim().parse().ok())?
    })
}

fn parse_pid_list(content: &str) -> Vec<u32> {
    content
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect()
}

fn limit_value(limit: i64) -> String {
    if limit > 0 {
        limit.to_string()
    } else {
        "max".to_string()
    }
}

// =============================================================================
// procfs fallback
// =============================================================================

/// Accessor that treats the main process and its descendants as the container.
#[derive(Debug, Clone)]
pub struct ProcfsAccessor {
    proc_root: PathBuf,
}

/// Fields of `/proc/<pid>/stat` the accessor needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub ppid: u32,
    pub utime: u64,
    pub stime: u64,
}

impl ProcfsAccessor {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }

    /// Uses a different procfs mount point.
    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self
    }

    async fn stat(&self, pid: u32) -> Option<ProcStat> {
        let path = self.proc_root.join(pid.to_string()).join("stat");
        let content = tokio::fs::read_to_string(path).await.ok()?;
        parse_proc_stat(&content)
    }

    async fn descendants(&self, main_pid: u32) -> Result<Vec<u32>> {
        if self.stat(main_pid).await.is_none() {
            return Err(Error::NoSuchProcess { pid: main_pid });
        }

        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        let mut entries = tokio::fs::read_dir(&self.proc_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            // Processes exit while we walk; skip the ones that are gone.
            if let Some(stat) = self.stat(pid).await {
                children.entry(stat.ppid).or_default().push(pid);
            }
        }

        let mut found = BTreeSet::new();
        let mut queue = VecDeque::from([main_pid]);
        while let Some(pid) = queue.pop_front() {
            if found.insert(pid)
                && let Some(kids) = children.get(&pid)
            {
                queue.extend(kids.iter().copied());
            }
        }
        Ok(found.into_iter().collect())
    }
}

impl Default for ProcfsAccessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceAccessor for ProcfsAccessor {
    async fn list_pids(&self, main_pid: u32) -> Result<Vec<u32>> {
        self.descendants(main_pid).await
    }

    async fn read_stats(&self, main_pid: u32) -> Result<ContainerStats> {
        let pids = self.descendants(main_pid).await?;
        let page_size = sysconf(libc::_SC_PAGESIZE, 4096);
        let ticks = sysconf(libc::_SC_CLK_TCK, 100);

        let mut memory_usage_bytes = 0;
        let mut cpu_ticks = 0;
        for &pid in &pids {
            let statm = self.proc_root.join(pid.to_string()).join("statm");
            if let Ok(content) = tokio::fs::read_to_string(statm).await
                && let Some(resident) = content
                    .split_whitespace()
                    .nth(1)
                    .and_then(|v| v.parse::<u64>().ok())
            {
                memory_usage_bytes += resident * page_size;
            }
            if let Some(stat) = self.stat(pid).await {
                cpu_ticks += stat.utime + stat.stime;
            }
        }

        Ok(ContainerStats {
            pids_current: pids.len() as u64,
            pids,
            memory_usage_bytes,
            memory_limit_bytes: None,
            cpu_usage_usec: cpu_ticks * 1_000_000 / ticks,
        })
    }

    async fn update(&self, _main_pid: u32, _resources: &LinuxResources) -> Result<()> {
        Err(Error::NotSupported(
            "resource limits require cgroup v2".to_string(),
        ))
    }

    fn name(&self) -> &'static str {
        "procfs"
    }
}

/// Parses `/proc/<pid>/stat`; the command name may contain spaces and parens.
pub fn parse_proc_stat(content: &str) -> Option<ProcStat> {
    let rest = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    Some(ProcStat {
        ppid: fields.get(1)?.parse().ok()?,
        utime: fields.get(11)?.parse().ok()?,
        stime: fields.get(12)?.parse().ok()?,
    })
}

fn sysconf(name: libc::c_int, fallback: u64) -> u64 {
    // SAFETY: sysconf only reads process-wide configuration.
    let value = unsafe { libc::sysconf(name) };
    if value > 0 { value as u64 } else { fallback }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unified_cgroup() {
        let content = "12:pids:/legacy\n0::/kubepods/pod1/c1\n";
        assert_eq!(parse_unified_cgroup(content), Some("/kubepods/pod1/c1"));
        assert_eq!(parse_unified_cgroup("3:cpu:/x\n"), None);
    }

    #[test]
    fn test_parse_max() {
        assert_eq!(parse_max("max\n"), None);
        assert_eq!(parse_max("1048576\n"), Some(1_048_576));
    }

    #[test]
    fn test_parse_cpu_usage() {
        let content = "usage_usec 123456\nuser_usec 100000\nsystem_usec 23456\n";
        assert_eq!(parse_cpu_usage(content), Some(123_456));
        assert_eq!(parse_cpu_usage("user_usec 1\n"), None);
    }

    #[test]
    fn test_parse_proc_stat_with_spaces_in_comm() {
        let content = "4242 (my (odd) proc) S 17 4242 4242 0 -1 4194560 100 0 0 0 7 3 0 0 20 0 1";
        let stat = parse_proc_stat(content).unwrap();
        assert_eq!(stat.ppid, 17);
        assert_eq!(stat.utime, 7);
        assert_eq!(stat.stime, 3);
    }

    #[test]
    fn test_limit_value() {
        assert_eq!(limit_value(1024), "1024");
        assert_eq!(limit_value(0), "max");
        assert_eq!(limit_value(-1), "max");
    }
}
