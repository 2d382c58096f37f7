//! The cluster node directory.
//!
//! The authoritative in-memory map of known peers, each annotated with a
//! lifecycle state. Monitors interact with it only through typed
//! operations (`get_node`, `down_node`, `up_node`); state transitions are
//! published as [`DirectoryEvent`]s on a channel rather than callbacks,
//! keeping the dependency graph acyclic.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Identity of a remote node: structural equality on (host, port).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Error returned when parsing a `host:port` node specification fails.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NodeAddressParseError {
    #[error("missing ':' separator in node address '{0}'")]
    MissingSeparator(String),
    #[error("empty host in node address '{0}'")]
    EmptyHost(String),
    #[error("invalid port in node address '{0}'")]
    InvalidPort(String),
}

impl FromStr for NodeAddress {
    type Err = NodeAddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| NodeAddressParseError::MissingSeparator(s.to_string()))?;
        if host.is_empty() {
            return Err(NodeAddressParseError::EmptyHost(s.to_string()));
        }
        let port = port
            .parse()
            .map_err(|_| NodeAddressParseError::InvalidPort(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// Lifecycle state of a node as seen by the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Serving traffic.
    Active,
    /// Joining; not yet serving.
    Prepare,
    /// Synchronized and eligible to become active.
    Ready,
    /// Considered unreachable; excluded from routing.
    Down,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Active => "active",
            NodeState::Prepare => "prepare",
            NodeState::Ready => "ready",
            NodeState::Down => "down",
        };
        write!(f, "{s}")
    }
}

impl FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(NodeState::Active),
            "prepare" => Ok(NodeState::Prepare),
            "ready" => Ok(NodeState::Ready),
            "down" => Ok(NodeState::Down),
            other => Err(format!("unknown node state '{other}'")),
        }
    }
}

/// Role of a node in the storage topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Owns a partition and accepts writes.
    Master,
    /// Replicates a master.
    Slave,
    /// Routes client traffic; owns no data.
    Proxy,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeRole::Master => "master",
            NodeRole::Slave => "slave",
            NodeRole::Proxy => "proxy",
        };
        write!(f, "{s}")
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "master" => Ok(NodeRole::Master),
            "slave" => Ok(NodeRole::Slave),
            "proxy" => Ok(NodeRole::Proxy),
            other => Err(format!("unknown node role '{other}'")),
        }
    }
}

/// A single entry in the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub address: NodeAddress,
    pub role: NodeRole,
    pub state: NodeState,
    /// Relative share of client traffic this node should receive.
    pub balance: u32,
}

impl Node {
    /// Creates a node in the state newly registered nodes enter:
    /// proxy role, active, no traffic share until rebalanced.
    pub fn new(address: NodeAddress) -> Self {
        Self {
            address,
            role: NodeRole::Proxy,
            state: NodeState::Active,
            balance: 0,
        }
    }
}

/// Membership and state-transition notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryEvent {
    NodeAdded(NodeAddress),
    NodeRemoved(NodeAddress),
    NodeDown(NodeAddress),
    NodeUp(NodeAddress),
}

struct Inner {
    nodes: HashMap<NodeAddress, Node>,
    /// Insertion order; drives `snapshot` and listing output.
    order: Vec<NodeAddress>,
}

/// The authoritative map of cluster peers.
///
/// Shared-read by every monitor, mutated by event publications. One
/// mutex serializes all map access and state transitions; critical
/// sections never block on I/O.
pub struct NodeDirectory {
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<DirectoryEvent>,
}

impl NodeDirectory {
    /// Creates an empty directory and the receiving end of its event
    /// stream. The receiver should be consumed by a background task.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DirectoryEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let directory = Self {
            inner: Mutex::new(Inner {
                nodes: HashMap::new(),
                order: Vec::new(),
            }),
            events,
        };
        (directory, rx)
    }

    /// Locks the map, recovering from poisoning: a transition must never
    /// fail, and the map itself stays consistent (every mutation is a
    /// single field store).
    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: DirectoryEvent) {
        if self.events.send(event).is_err() {
            warn!("directory event channel closed, dropping event");
        }
    }

    /// Registers a node. Returns false (and changes nothing) if a node
    /// with the same address is already present.
    pub fn add_node(&self, node: Node) -> bool {
        let address = node.address.clone();
        {
            let mut inner = self.lock();
            if inner.nodes.contains_key(&address) {
                debug!("node {address} already registered");
                return false;
            }
            inner.order.push(address.clone());
            inner.nodes.insert(address.clone(), node);
        }
        info!("node {address} added to directory");
        self.emit(DirectoryEvent::NodeAdded(address));
        true
    }

    /// Unregisters a node, returning its last known entry.
    pub fn remove_node(&self, address: &NodeAddress) -> Option<Node> {
        let removed = {
            let mut inner = self.lock();
            let removed = inner.nodes.remove(address);
            if removed.is_some() {
                inner.order.retain(|a| a != address);
            }
            removed
        };
        if removed.is_some() {
            info!("node {address} removed from directory");
            self.emit(DirectoryEvent::NodeRemoved(address.clone()));
        }
        removed
    }

    /// Looks up a node by address.
    pub fn get_node(&self, address: &NodeAddress) -> Option<Node> {
        self.lock().nodes.get(address).cloned()
    }

    /// Transitions a node to `down`. Idempotent and infallible: an
    /// already-down or unknown node is a no-op.
    pub fn down_node(&self, address: &NodeAddress) {
        let changed = {
            let mut inner = self.lock();
            match inner.nodes.get_mut(address) {
                Some(node) if node.state != NodeState::Down => {
                    node.state = NodeState::Down;
                    true
                }
                Some(_) => false,
                None => {
                    warn!("down_node for unknown node {address}");
                    false
                }
            }
        };
        if changed {
            info!("node {address} marked down");
            self.emit(DirectoryEvent::NodeDown(address.clone()));
        } else {
            debug!("down_node for {address} is a no-op");
        }
    }

    /// Transitions a node out of `down`, back to `active`. Idempotent:
    /// only a node currently down is affected.
    pub fn up_node(&self, address: &NodeAddress) {
        let changed = {
            let mut inner = self.lock();
            match inner.nodes.get_mut(address) {
                Some(node) if node.state == NodeState::Down => {
                    node.state = NodeState::Active;
                    true
                }
                Some(_) => false,
                None => {
                    warn!("up_node for unknown node {address}");
                    false
                }
            }
        };
        if changed {
            info!("node {address} marked up");
            self.emit(DirectoryEvent::NodeUp(address.clone()));
        } else {
            debug!("up_node for {address} is a no-op");
        }
    }

    /// Returns every node in insertion order.
    pub fn snapshot(&self) -> Vec<Node> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|a| inner.nodes.get(a).cloned())
            .collect()
    }

    /// Returns every address in insertion order.
    pub fn addresses(&self) -> Vec<NodeAddress> {
        self.lock().order.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().nodes.is_empty()
    }
}
