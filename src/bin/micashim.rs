//! micashim - per-container shim process
//!
//! Supervises one container through an OCI runtime binary and serves
//! lifecycle requests on a Unix socket.
//!
//! ## Usage
//!
//! ```sh
//! micashim --address /run/mica/c1.sock --id c1 --runtime /usr/local/bin/mica-runtime
//! micashim --config /etc/mica/shim.json
//! ```
//!
//! Every flag can also be set through a `MICASHIM_*` environment variable.
//! Flags override values from the configuration file.
//!
//! ## Shutdown
//!
//! On SIGTERM, SIGINT or an accepted `shutdown` request the shim stops and
//! deletes a live container (honouring the grace period), removes its
//! socket and exits 0.

use anyhow::Context;
use clap::Parser;
use micashim::{
    ControlServer, LifecycleStateMachine, NativeSupervisor, RequestDispatcher, ShimConfig,
    TracingPublisher, resources,
};
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Parser, Debug)]
#[command(name = "micashim", version, about = "Per-container shim for OCI runtimes")]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "MICASHIM_CONFIG")]
    config: Option<PathBuf>,

    /// Control socket path.
    #[arg(long, env = "MICASHIM_ADDRESS")]
    address: Option<PathBuf>,

    /// Default OCI runtime binary.
    #[arg(long, env = "MICASHIM_RUNTIME")]
    runtime: Option<PathBuf>,

    /// Orchestrator namespace.
    #[arg(long, env = "MICASHIM_NAMESPACE")]
    namespace: Option<String>,

    /// Working directory for shim state.
    #[arg(long, env = "MICASHIM_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Container ID.
    #[arg(long, env = "MICASHIM_ID")]
    id: Option<String>,

    /// Seconds between SIGTERM and SIGKILL on stop.
    #[arg(long, env = "MICASHIM_GRACE_PERIOD")]
    grace_period: Option<u64>,

    /// Become a child subreaper and reap orphaned descendants.
    #[arg(long, env = "MICASHIM_REAP_ORPHANS")]
    reap_orphans: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "MICASHIM_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> anyhow::Result<ShimConfig> {
        let mut config = match &self.config {
            Some(path) => ShimConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => ShimConfig::default(),
        };

        if let Some(address) = self.address {
            config = config.with_address(address);
        }
        if let Some(runtime) = self.runtime {
            config = config.with_runtime_path(runtime);
        }
        if let Some(namespace) = self.namespace {
            config = config.with_namespace(namespace);
        }
        if let Some(work_dir) = self.work_dir {
            config = config.with_work_dir(work_dir);
        }
        if let Some(id) = self.id {
            config = config.with_container_id(id);
        }
        if let Some(secs) = self.grace_period {
            config.grace_period = secs;
        }
        if self.reap_orphans {
            config = config.with_reap_orphans(true);
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = args.log_level.parse::<Level>().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_ansi(false)
        .compact()
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Failed to set tracing subscriber");
        return ExitCode::FAILURE;
    }

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %format!("{e:#}"), "configuration error");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        id = %config.container_id,
        namespace = %config.namespace,
        address = %config.address.display(),
        "micashim starting"
    );

    match run(config).await {
        Ok(()) => {
            info!("micashim exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "shim failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ShimConfig) -> anyhow::Result<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&config.work_dir)
        .with_context(|| format!("creating work dir {}", config.work_dir.display()))?;

    if config.reap_orphans {
        become_subreaper()?;
    }

    let (supervisor, exits) = NativeSupervisor::with_orphan_reaping(config.reap_orphans);
    let machine = LifecycleStateMachine::builder(Arc::new(supervisor), exits)
        .resources(resources::detect())
        .events(Arc::new(TracingPublisher))
        .grace_period(config.grace_period())
        .build();

    let config = Arc::new(config);
    let dispatcher = Arc::new(RequestDispatcher::new(machine, Arc::clone(&config)));
    let server = ControlServer::bind(&config.address, Arc::clone(&dispatcher))
        .with_context(|| format!("binding {}", config.address.display()))?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut shutdown_rx = dispatcher.shutdown_requested();
    let shutdown = async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("received SIGINT, initiating shutdown"),
            _ = shutdown_rx.wait_for(|requested| *requested) => {
                info!("shutdown requested over control channel");
            }
        }
    };

    server.serve(shutdown).await?;

    if let Err(e) = dispatcher.teardown().await {
        warn!(error = %e, "container teardown failed");
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn become_subreaper() -> anyhow::Result<()> {
    // SAFETY: PR_SET_CHILD_SUBREAPER only changes how orphans are re-parented.
    let ret = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error()).context("prctl(PR_SET_CHILD_SUBREAPER)");
    }
    info!("running as child subreaper");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn become_subreaper() -> anyhow::Result<()> {
    warn!("child subreaper is only available on Linux, orphans are reaped by init");
    Ok(())
}
