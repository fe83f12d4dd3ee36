//! Shim configuration.
//!
//! [`ShimConfig`] is captured once at startup and shared read-only (as
//! `Arc<ShimConfig>`) for the lifetime of the shim process.

use crate::constants::{
    DEFAULT_CONTAINER_ID, DEFAULT_GRACE_PERIOD, DEFAULT_NAMESPACE, DEFAULT_RUNTIME_PATH,
    DEFAULT_SOCKET_PATH, DEFAULT_WORK_DIR, validate_container_id,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Immutable shim configuration.
///
/// Every field has a default, so a JSON file only needs to name the values it
/// overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShimConfig {
    /// Control socket path.
    pub address: PathBuf,
    /// Runtime binary used when `Create` does not name one.
    pub runtime_path: PathBuf,
    /// Orchestrator namespace.
    pub namespace: String,
    /// Working directory for shim state.
    pub work_dir: PathBuf,
    /// ID of the container this shim owns.
    pub container_id: String,
    /// Seconds between SIGTERM and SIGKILL during stop.
    pub grace_period: u64,
    /// Also reap re-parented descendants (child subreaper mode).
    pub reap_orphans: bool,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            address: PathBuf::from(DEFAULT_SOCKET_PATH),
            runtime_path: PathBuf::from(DEFAULT_RUNTIME_PATH),
            namespace: DEFAULT_NAMESPACE.to_string(),
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            container_id: DEFAULT_CONTAINER_ID.to_string(),
            grace_period: DEFAULT_GRACE_PERIOD.as_secs(),
            reap_orphans: false,
        }
    }
}

impl ShimConfig {
    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// resulting configuration fails [`validate`](Self::validate).
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for values the shim cannot run with.
    pub fn validate(&self) -> Result<()> {
        validate_container_id(&self.container_id).map_err(|reason| {
            Error::InvalidContainerId {
                id: self.container_id.clone(),
                reason: reason.to_string(),
            }
        })?;
        if self.grace_period == 0 {
            return Err(Error::Internal("grace period must be non-zero".to_string()));
        }
        if self.address.as_os_str().is_empty() {
            return Err(Error::Internal("control socket address is empty".to_string()));
        }
        Ok(())
    }

    /// Grace period as a [`Duration`].
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period)
    }

    pub fn with_address(mut self, address: impl Into<PathBuf>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_runtime_path(mut self, runtime_path: impl Into<PathBuf>) -> Self {
        self.runtime_path = runtime_path.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn with_container_id(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = container_id.into();
        self
    }

    /// Sets the grace period, rounded up to whole seconds.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        let secs = grace_period.as_secs();
        self.grace_period = if grace_period.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        };
        self
    }

    pub fn with_reap_orphans(mut self, reap_orphans: bool) -> Self {
        self.reap_orphans = reap_orphans;
        self
    }
}
