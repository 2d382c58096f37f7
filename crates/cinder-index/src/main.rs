//! cinder-index: the cluster index server.
//!
//! Tracks the membership and health of every data node in a cinder
//! cluster. Each registered node gets a dedicated monitor worker that
//! pings it and executes queued control-plane work; debounced health
//! transitions update the node directory, which is persisted and fanned
//! out to the rest of the cluster.

mod config;
mod coordinator;
mod persist;
mod server;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use cinder_cluster::{
    MonitorOption, Node, NodeDirectory, ShutdownController, TimeWatcher, TimeWatcherProcessor,
};

use crate::config::IndexConfig;
use crate::coordinator::Coordinator;
use crate::server::ServerContext;

/// Cluster index server for cinder.
#[derive(Parser)]
#[command(name = "cinder-index", version, about)]
struct Args {
    /// Address to bind the control listener to.
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Control listener port.
    #[arg(long, default_value_t = 11220)]
    port: u16,

    /// Consecutive probe failures tolerated before a node is marked
    /// down. 0 disables down/up transitions.
    #[arg(long, default_value_t = 3)]
    monitor_threshold: u32,

    /// Milliseconds between liveness probes per node. 0 disables
    /// probing.
    #[arg(long, default_value_t = 5000)]
    monitor_interval_ms: u64,

    /// Milliseconds between time-watcher sweeps. 0 disables the
    /// watcher.
    #[arg(long, default_value_t = 1000)]
    time_watcher_interval_ms: u64,

    /// Control handlers pending longer than this many milliseconds are
    /// flagged as slow.
    #[arg(long, default_value_t = 1000)]
    slow_threshold_ms: u64,

    /// Directory for the persisted node table. Persistence is disabled
    /// when unset.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Data node to register at startup, as host:port. Repeatable.
    #[arg(long = "node")]
    nodes: Vec<String>,
}

impl Args {
    fn into_config(self) -> Result<IndexConfig, String> {
        let seed_nodes =
            config::parse_node_specs(&self.nodes).map_err(|e| e.to_string())?;
        Ok(IndexConfig {
            listen: SocketAddr::new(self.host, self.port),
            monitor: MonitorOption {
                threshold: self.monitor_threshold,
                interval: Duration::from_millis(self.monitor_interval_ms),
            },
            polling_interval: Duration::from_millis(self.time_watcher_interval_ms),
            slow_threshold: Duration::from_millis(self.slow_threshold_ms),
            data_dir: self.data_dir,
            seed_nodes,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cinder=info".into()),
        )
        .init();

    let config = match Args::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("index server failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: IndexConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("cinder index server starting");

    let (directory, events) = NodeDirectory::new();
    let directory = Arc::new(directory);
    let controller = ShutdownController::new();

    let nodes_path = config.nodes_path();
    let coordinator = Arc::new(Coordinator::new(
        Arc::clone(&directory),
        config.monitor,
        controller.subscribe(),
        nodes_path.clone(),
    ));

    // event loop first, so restored and seed nodes get monitors
    let event_loop = tokio::spawn(Arc::clone(&coordinator).run_events(events));

    // restore the persisted node table, then register any new seeds
    if let Some(path) = &nodes_path {
        let restored = persist::load(path)?;
        if !restored.is_empty() {
            info!("restoring {} node(s) from {}", restored.len(), path.display());
        }
        for node in restored {
            directory.add_node(node);
        }
    }
    for address in &config.seed_nodes {
        if directory.get_node(address).is_none() {
            directory.add_node(Node::new(address.clone()));
        }
    }

    let watcher = Arc::new(TimeWatcher::new());
    let sweeper = tokio::spawn(
        TimeWatcherProcessor::new(
            Arc::clone(&watcher),
            config.polling_interval,
            controller.subscribe(),
        )
        .run(),
    );

    let listener = server::bind(config.listen).await?;
    let context = Arc::new(ServerContext {
        directory: Arc::clone(&directory),
        coordinator: Arc::clone(&coordinator),
        watcher,
        slow_threshold: config.slow_threshold,
    });
    let control = tokio::spawn(server::run(
        listener,
        context,
        controller.subscribe(),
    ));

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
    }
    controller.request();

    // drain everything before exiting
    let _ = control.await;
    let _ = sweeper.await;
    let _ = event_loop.await;
    coordinator.join_monitors().await;

    info!("cinder index server stopped");
    Ok(())
}
