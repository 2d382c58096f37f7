//! Error taxonomy for the monitor core.
//!
//! Nothing here escapes a monitor's run loop; every variant is
//! classified and counted as one failed probe against the peer.

use cinder_protocol::ConnectionError;

/// A single monitor-iteration failure.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// Connection open or reopen failed.
    #[error("transport failure: {0}")]
    Transport(ConnectionError),

    /// The ping probe itself failed (I/O, timeout, or bad reply).
    #[error("ping failed: {0}")]
    Operation(ConnectionError),

    /// A queued node-sync action failed against the peer.
    #[error("node sync failed: {0}")]
    Sync(ConnectionError),

    /// Node-sync work was refused because the peer is considered down.
    #[error("node is considered down, sync refused")]
    SyncRefused,

    /// The inbox delivered a queue kind this worker does not handle.
    #[error("unknown queue kind: {0}")]
    UnknownQueue(String),
}
