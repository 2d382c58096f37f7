//! Control-plane work queued onto monitor workers.
//!
//! Each monitor has an inbox of [`ThreadQueue`] messages, delivered in
//! enqueue order. The set of kinds a monitor understands is closed; tags
//! arriving from the control plane that name anything else decode into
//! [`ThreadQueue::Unknown`], which the worker rejects.

use std::time::Duration;

use cinder_protocol::{Connection, ConnectionError, PAYLOAD_END, REPLY_OK};
use tracing::debug;

use crate::directory::{Node, NodeDirectory};

/// Queue tag for monitor reconfiguration.
pub const IDENT_UPDATE_MONITOR_OPTION: &str = "update_monitor_option";

/// Queue tag for node-table synchronization.
pub const IDENT_NODE_SYNC: &str = "node_sync";

/// Runtime-tunable monitor parameters.
///
/// `threshold` is the number of consecutive failed probes tolerated
/// before a down transition is published; 0 disables publication.
/// `interval` is the maximum time the worker waits on its inbox before
/// probing; zero disables probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorOption {
    pub threshold: u32,
    pub interval: Duration,
}

impl MonitorOption {
    /// The state a freshly spawned monitor starts in: no escalation, no
    /// probing, until the first `update_monitor_option` arrives.
    pub const DISABLED: MonitorOption = MonitorOption {
        threshold: 0,
        interval: Duration::ZERO,
    };

    /// Parses `<threshold> <interval_ms>` control-plane arguments.
    pub fn from_args(args: &[&str]) -> Result<Self, QueueDecodeError> {
        let [threshold, interval_ms] = args else {
            return Err(QueueDecodeError::WrongArgCount {
                ident: IDENT_UPDATE_MONITOR_OPTION,
                expected: 2,
                got: args.len(),
            });
        };
        let threshold = threshold.parse().map_err(|_| QueueDecodeError::BadArg {
            ident: IDENT_UPDATE_MONITOR_OPTION,
            value: threshold.to_string(),
        })?;
        let interval_ms: u64 = interval_ms.parse().map_err(|_| QueueDecodeError::BadArg {
            ident: IDENT_UPDATE_MONITOR_OPTION,
            value: interval_ms.to_string(),
        })?;
        Ok(Self {
            threshold,
            interval: Duration::from_millis(interval_ms),
        })
    }
}

/// Replays the index's node table to the peer over its monitor
/// connection, so the peer's routing view converges with the directory.
#[derive(Debug, Clone)]
pub struct NodeSync {
    pub nodes: Vec<Node>,
}

impl NodeSync {
    /// Runs the sync against the peer. The connection is reopened first
    /// if a previous failure left it unusable.
    pub async fn run(&self, connection: &mut Connection) -> Result<(), ConnectionError> {
        if !connection.is_available() {
            connection.open().await?;
        }

        connection.write_line("node sync").await?;
        for node in &self.nodes {
            let line = format!(
                "{} {} {} {} {}",
                node.address.host, node.address.port, node.role, node.state, node.balance
            );
            connection.write_line(&line).await?;
        }
        connection.write_line(PAYLOAD_END).await?;

        let reply = connection.read_line().await?;
        if reply == REPLY_OK {
            debug!("node sync acknowledged ({} nodes)", self.nodes.len());
            Ok(())
        } else {
            Err(ConnectionError::Protocol(format!(
                "unexpected node sync reply: {reply}"
            )))
        }
    }
}

/// A tagged message on a monitor worker's inbox.
#[derive(Debug, Clone)]
pub enum ThreadQueue {
    /// Overwrite the worker's threshold and interval.
    UpdateMonitorOption(MonitorOption),
    /// Push the node table to the peer.
    NodeSync(NodeSync),
    /// Anything the control plane named that this worker does not
    /// handle. Carried through so the worker can log the offending tag.
    Unknown(String),
}

impl ThreadQueue {
    /// The tag naming this message's kind.
    pub fn ident(&self) -> &str {
        match self {
            ThreadQueue::UpdateMonitorOption(_) => IDENT_UPDATE_MONITOR_OPTION,
            ThreadQueue::NodeSync(_) => IDENT_NODE_SYNC,
            ThreadQueue::Unknown(ident) => ident,
        }
    }

    /// Decodes a control-plane `queue` request into a message.
    ///
    /// Unrecognized tags decode successfully into [`ThreadQueue::Unknown`]
    /// rather than failing here: whether a worker accepts a kind is the
    /// worker's decision, not the parser's. Malformed arguments for a
    /// known tag are a decode error.
    pub fn decode(
        ident: &str,
        args: &[&str],
        directory: &NodeDirectory,
    ) -> Result<Self, QueueDecodeError> {
        match ident {
            IDENT_UPDATE_MONITOR_OPTION => {
                Ok(ThreadQueue::UpdateMonitorOption(MonitorOption::from_args(args)?))
            }
            IDENT_NODE_SYNC => {
                if !args.is_empty() {
                    return Err(QueueDecodeError::WrongArgCount {
                        ident: IDENT_NODE_SYNC,
                        expected: 0,
                        got: args.len(),
                    });
                }
                Ok(ThreadQueue::NodeSync(NodeSync {
                    nodes: directory.snapshot(),
                }))
            }
            other => Ok(ThreadQueue::Unknown(other.to_string())),
        }
    }
}

/// Errors decoding a control-plane queue request.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueDecodeError {
    #[error("queue '{ident}' expects {expected} argument(s), got {got}")]
    WrongArgCount {
        ident: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("invalid argument '{value}' for queue '{ident}'")]
    BadArg { ident: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::NodeAddress;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    #[test]
    fn monitor_option_from_args() {
        let opt = MonitorOption::from_args(&["3", "5000"]).unwrap();
        assert_eq!(opt.threshold, 3);
        assert_eq!(opt.interval, Duration::from_millis(5000));

        assert!(matches!(
            MonitorOption::from_args(&["3"]).unwrap_err(),
            QueueDecodeError::WrongArgCount { got: 1, .. }
        ));
        assert!(matches!(
            MonitorOption::from_args(&["many", "5000"]).unwrap_err(),
            QueueDecodeError::BadArg { .. }
        ));
    }

    #[test]
    fn decode_known_and_unknown_tags() {
        let (dir, _rx) = NodeDirectory::new();
        dir.add_node(Node::new(NodeAddress::new("127.0.0.1", 1)));

        let q = ThreadQueue::decode("update_monitor_option", &["2", "100"], &dir).unwrap();
        assert_eq!(q.ident(), "update_monitor_option");

        let q = ThreadQueue::decode("node_sync", &[], &dir).unwrap();
        assert_eq!(q.ident(), "node_sync");
        match q {
            ThreadQueue::NodeSync(sync) => assert_eq!(sync.nodes.len(), 1),
            other => panic!("expected NodeSync, got {other:?}"),
        }

        let q = ThreadQueue::decode("node_shift", &[], &dir).unwrap();
        assert_eq!(q.ident(), "node_shift");
        assert!(matches!(q, ThreadQueue::Unknown(_)));
    }

    #[test]
    fn decode_rejects_bad_args() {
        let (dir, _rx) = NodeDirectory::new();
        assert!(ThreadQueue::decode("node_sync", &["extra"], &dir).is_err());
        assert!(ThreadQueue::decode("update_monitor_option", &[], &dir).is_err());
    }

    /// Peer that records a full `node sync` payload and replies OK.
    async fn spawn_sync_peer() -> (std::net::SocketAddr, oneshot::Receiver<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let mut received = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                let done = line == "END";
                received.push(line);
                if done {
                    write.write_all(b"OK\r\n").await.unwrap();
                    break;
                }
            }
            let _ = tx.send(received);
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn node_sync_sends_table_and_reads_ack() {
        let (addr, received) = spawn_sync_peer().await;

        let mut master = Node::new(NodeAddress::new("storage01", 11211));
        master.role = crate::directory::NodeRole::Master;
        master.balance = 2;
        let sync = NodeSync {
            nodes: vec![master, Node::new(NodeAddress::new("storage02", 11211))],
        };

        let mut conn = Connection::new("127.0.0.1", addr.port());
        // run() opens the connection itself when unavailable
        sync.run(&mut conn).await.unwrap();

        let lines = received.await.unwrap();
        assert_eq!(
            lines,
            vec![
                "node sync",
                "storage01 11211 master active 2",
                "storage02 11211 proxy active 0",
                "END",
            ]
        );
    }

    #[tokio::test]
    async fn node_sync_propagates_bad_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line == "END" {
                    write.write_all(b"SERVER_ERROR out of sync\r\n").await.unwrap();
                    break;
                }
            }
        });

        let sync = NodeSync { nodes: Vec::new() };
        let mut conn = Connection::new("127.0.0.1", addr.port());
        let err = sync.run(&mut conn).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Protocol(_)));
    }
}
