//! liveness-daemon: runs one node (router, worker, client or server) with its
//! heartbeat until SIGINT or SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use liveness_core::{ConnectionDescriptor, IdentityStore, NodeRole, NodeSocket};
use liveness_daemon::config::{DaemonConfig, Overrides};
use liveness_daemon::{WorkerPool, node, shutdown};

#[derive(Parser, Debug)]
#[command(name = "liveness-daemon")]
#[command(about = "Node liveness daemon with heartbeats and socket recovery")]
struct Args {
    /// Path to a JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node role: router, worker, client or server
    #[arg(short, long)]
    role: Option<NodeRole>,

    /// Main socket endpoint, e.g. tcp://localhost:5555 or ipc:///tmp/node.sock
    #[arg(short, long)]
    endpoint: Option<ConnectionDescriptor>,

    /// Heartbeat endpoint; enables the heartbeat
    #[arg(long)]
    heartbeat: Option<ConnectionDescriptor>,

    /// Seconds between heartbeats
    #[arg(long)]
    interval: Option<f64>,

    /// Seconds of silence before a heartbeat counts as missed
    #[arg(long)]
    timeout: Option<f64>,

    /// Missed heartbeats tolerated before eviction
    #[arg(long)]
    max_missed: Option<u32>,

    /// File the node id is persisted in
    #[arg(long)]
    identity_file: Option<PathBuf>,

    /// Worker nodes to run on one shared context (worker role only)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            role: self.role,
            endpoint: self.endpoint.clone(),
            heartbeat: self.heartbeat.clone(),
            interval_secs: self.interval,
            timeout_secs: self.timeout,
            max_missed: self.max_missed,
            identity_file: self.identity_file.clone(),
            workers: self.workers,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,liveness_core=debug,liveness_daemon=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };
    config.apply(args.overrides())?;

    let store = IdentityStore::new(&config.identity_file);
    let identity = store
        .identity_for(config.role)
        .with_context(|| format!("Failed to load identity from {}", store.path().display()))?;

    let node_config = config.to_node_config()?;
    let workers = config.worker_count()?;

    let cancel = CancellationToken::new();
    let signals = shutdown::spawn_signal_handler(cancel.clone());

    let result = if workers > 1 {
        let pool = WorkerPool::new(&node_config, &identity, workers)?;
        for worker in pool.workers() {
            worker.log_details();
        }
        info!("Daemon running {} workers. Press Ctrl+C to stop.", workers);
        pool.run(node::echo(), cancel.clone()).await
    } else {
        let node = NodeSocket::new(node_config, identity).context("Failed to create node")?;
        node.log_details();
        info!("Daemon running. Press Ctrl+C to stop.");
        node::run(&node, config.client_interval()?, cancel.clone()).await
    };

    cancel.cancel();
    if let Err(e) = signals.await {
        tracing::debug!("Signal handler ended abnormally: {}", e);
    }
    info!("Shut down");
    result
}
