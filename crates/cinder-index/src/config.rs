//! Index server configuration.
//!
//! Converts CLI-friendly values (millisecond counts, `host:port` node
//! specs) into the internal types used by the cluster layer.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use cinder_cluster::{MonitorOption, NodeAddress, NodeAddressParseError};

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Address the control-plane listener binds to.
    pub listen: SocketAddr,
    /// Initial monitor parameters delivered to every spawned monitor.
    pub monitor: MonitorOption,
    /// Time-watcher polling interval; zero disables the watcher.
    pub polling_interval: Duration,
    /// Control handlers pending longer than this are flagged as slow.
    pub slow_threshold: Duration,
    /// Directory for the persisted node table; `None` disables
    /// persistence.
    pub data_dir: Option<PathBuf>,
    /// Nodes to register at startup.
    pub seed_nodes: Vec<NodeAddress>,
}

impl IndexConfig {
    /// Path of the persisted node table, if persistence is enabled.
    pub fn nodes_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("nodes.json"))
    }
}

/// Parses `host:port` node specifications.
pub fn parse_node_specs(specs: &[String]) -> Result<Vec<NodeAddress>, NodeAddressParseError> {
    specs.iter().map(|s| s.parse()).collect()
}
