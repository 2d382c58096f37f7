//! Cluster coordinator for the index server.
//!
//! Owns the monitor handles (one per watched data node) and reacts to
//! directory events: membership changes spawn or retire monitors, and
//! every change is persisted and fanned out to all peers as `node_sync`
//! work on their monitor queues.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use cinder_cluster::{
    DirectoryEvent, MonitorHandle, MonitorOption, NodeAddress, NodeDirectory, NodeMonitor,
    NodeSync, Shutdown, ThreadQueue,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use crate::persist;

/// Spawns, feeds, and retires the per-peer monitor workers.
pub struct Coordinator {
    directory: Arc<NodeDirectory>,
    monitors: Mutex<HashMap<NodeAddress, MonitorHandle>>,
    monitor_defaults: MonitorOption,
    shutdown: Shutdown,
    nodes_path: Option<PathBuf>,
}

impl Coordinator {
    pub fn new(
        directory: Arc<NodeDirectory>,
        monitor_defaults: MonitorOption,
        shutdown: Shutdown,
        nodes_path: Option<PathBuf>,
    ) -> Self {
        Self {
            directory,
            monitors: Mutex::new(HashMap::new()),
            monitor_defaults,
            shutdown,
            nodes_path,
        }
    }

    /// Starts a monitor for the given peer and hands it the configured
    /// defaults through its own queue. No-op if already watched.
    pub async fn watch_node(&self, address: NodeAddress) {
        let mut monitors = self.monitors.lock().await;
        if monitors.contains_key(&address) {
            debug!("node {address} is already watched");
            return;
        }

        let handle = NodeMonitor::spawn(
            address.clone(),
            Arc::clone(&self.directory),
            self.shutdown.clone(),
        );
        handle
            .enqueue(ThreadQueue::UpdateMonitorOption(self.monitor_defaults))
            .await;
        info!("watching node {address}");
        monitors.insert(address, handle);
    }

    /// Retires the monitor for a peer. Dropping the handle closes the
    /// worker's inbox, which it treats as a stop request.
    pub async fn unwatch_node(&self, address: &NodeAddress) {
        if self.monitors.lock().await.remove(address).is_some() {
            info!("no longer watching node {address}");
        }
    }

    /// Enqueues work onto one peer's monitor. Returns false if the peer
    /// is not watched or its worker is gone.
    pub async fn enqueue(&self, address: &NodeAddress, queue: ThreadQueue) -> bool {
        let monitors = self.monitors.lock().await;
        match monitors.get(address) {
            Some(handle) => handle.enqueue(queue).await,
            None => false,
        }
    }

    /// Pushes the current node table to every watched peer.
    async fn broadcast_node_table(&self) {
        let sync = NodeSync {
            nodes: self.directory.snapshot(),
        };
        let monitors = self.monitors.lock().await;
        for handle in monitors.values() {
            handle.enqueue(ThreadQueue::NodeSync(sync.clone())).await;
        }
    }

    fn persist(&self) {
        let Some(path) = &self.nodes_path else {
            return;
        };
        if let Err(e) = persist::save(path, &self.directory.snapshot()) {
            error!("failed to persist node table to {}: {e}", path.display());
        }
    }

    /// Consumes the directory's event stream until shutdown.
    pub async fn run_events(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<DirectoryEvent>,
    ) {
        let mut shutdown = self.shutdown.clone();
        loop {
            let event = tokio::select! {
                _ = shutdown.requested() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            debug!("directory event: {event:?}");
            match event {
                DirectoryEvent::NodeAdded(address) => {
                    self.persist();
                    self.watch_node(address).await;
                    self.broadcast_node_table().await;
                }
                DirectoryEvent::NodeRemoved(address) => {
                    self.persist();
                    self.unwatch_node(&address).await;
                    self.broadcast_node_table().await;
                }
                DirectoryEvent::NodeDown(_) | DirectoryEvent::NodeUp(_) => {
                    self.persist();
                    self.broadcast_node_table().await;
                }
            }
        }
        info!("coordinator event loop stopped");
    }

    /// Waits for every monitor to finish. Call after shutdown has been
    /// requested.
    pub async fn join_monitors(&self) {
        let handles: Vec<MonitorHandle> = {
            let mut monitors = self.monitors.lock().await;
            monitors.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.join().await;
        }
    }
}
