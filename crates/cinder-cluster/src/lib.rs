//! cinder-cluster: cluster coordination and node health for cinder.
//!
//! The index server tracks the liveness of every data node in the
//! cluster. This crate provides the pieces that make that work:
//!
//! - **Node directory**: the authoritative in-memory map of known peers
//!   and their lifecycle states, with typed transition operations.
//! - **Node monitor**: one long-lived worker task per watched peer that
//!   probes the peer, executes queued control-plane work against it, and
//!   publishes debounced up/down transitions to the directory.
//! - **Time watcher**: a periodic sweeper that flags registered
//!   timestamps which have been pending longer than a threshold.
//! - **Shutdown**: cooperative cancellation shared by all workers.
//!
//! # Health debouncing
//!
//! A monitor counts consecutive probe failures and publishes a
//! `down_node` transition only when the count reaches a configurable
//! threshold, so transient faults do not cause premature failover. A
//! success after escalation publishes `up_node` and resets the count.

mod directory;
mod error;
mod monitor;
mod queue;
mod shutdown;
pub mod time;
mod watcher;

pub use directory::{
    DirectoryEvent, Node, NodeAddress, NodeAddressParseError, NodeDirectory, NodeRole, NodeState,
};
pub use error::MonitorError;
pub use monitor::{MonitorHandle, MonitorStatus, NodeMonitor};
pub use queue::{MonitorOption, NodeSync, QueueDecodeError, ThreadQueue};
pub use shutdown::{Shutdown, ShutdownController};
pub use watcher::{TimeWatcher, TimeWatcherProcessor, WatchId};
