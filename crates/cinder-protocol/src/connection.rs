//! Async TCP connection to a remote cinder node.
//!
//! A `Connection` is opened lazily, reopened on demand after a detected
//! failure, and closed on teardown. It is exclusively owned by one user
//! (typically a node monitor) and is deliberately not `Clone`: sharing a
//! control-plane stream across tasks would interleave request/response
//! pairs.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::ConnectionError;

/// Upper bound for a single protocol line, terminator included.
/// Prevents unbounded buffering on a misbehaving peer.
const MAX_LINE_LEN: usize = 8192;

/// Default per-operation timeout applied to connect, read, and write.
const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(10);

/// A line-framed TCP connection to a remote node.
pub struct Connection {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    read_buf: BytesMut,
    available: bool,
    op_timeout: Duration,
}

impl Connection {
    /// Creates a fresh, unopened connection to the given peer.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
            read_buf: BytesMut::with_capacity(4096),
            available: false,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    /// Overrides the per-operation timeout.
    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    /// Establishes (or re-establishes) the stream to the peer.
    ///
    /// Any previously buffered bytes are discarded; a half-parsed response
    /// from a dead stream must not leak into the new one.
    pub async fn open(&mut self) -> Result<(), ConnectionError> {
        self.stream = None;
        self.read_buf.clear();
        self.available = false;

        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = match timeout(self.op_timeout, connect).await {
            Err(_) => return Err(ConnectionError::TimedOut),
            Ok(Err(e)) => return Err(ConnectionError::Io(e)),
            Ok(Ok(stream)) => stream,
        };

        debug!("connected to {}:{}", self.host, self.port);
        self.stream = Some(stream);
        self.available = true;
        Ok(())
    }

    /// Reports whether the last I/O left the stream usable.
    pub fn is_available(&self) -> bool {
        self.available && self.stream.is_some()
    }

    /// Drops the stream. The connection can be reopened later.
    pub fn close(&mut self) {
        self.stream = None;
        self.read_buf.clear();
        self.available = false;
    }

    /// Writes one CRLF-terminated line. `line` must not contain CR or LF.
    pub async fn write_line(&mut self, line: &str) -> Result<(), ConnectionError> {
        let stream = self.stream.as_mut().ok_or(ConnectionError::NotOpen)?;

        let mut out = Vec::with_capacity(line.len() + 2);
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");

        match timeout(self.op_timeout, stream.write_all(&out)).await {
            Err(_) => {
                self.available = false;
                Err(ConnectionError::TimedOut)
            }
            Ok(Err(e)) => {
                self.available = false;
                Err(ConnectionError::Io(e))
            }
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Reads one line, stripping the CRLF terminator.
    ///
    /// A bare `\n` terminator is accepted as well; interactive tools such
    /// as netcat do not always send CRLF.
    pub async fn read_line(&mut self) -> Result<String, ConnectionError> {
        loop {
            if let Some(pos) = self.read_buf.iter().position(|&b| b == b'\n') {
                let mut line = self.read_buf.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                return String::from_utf8(line.to_vec())
                    .map_err(|_| ConnectionError::Protocol("invalid utf-8 in line".into()));
            }

            if self.read_buf.len() > MAX_LINE_LEN {
                self.available = false;
                return Err(ConnectionError::Protocol(format!(
                    "line exceeds {MAX_LINE_LEN} bytes"
                )));
            }

            let stream = self.stream.as_mut().ok_or(ConnectionError::NotOpen)?;
            match timeout(self.op_timeout, stream.read_buf(&mut self.read_buf)).await {
                Err(_) => {
                    self.available = false;
                    return Err(ConnectionError::TimedOut);
                }
                Ok(Err(e)) => {
                    self.available = false;
                    return Err(ConnectionError::Io(e));
                }
                Ok(Ok(0)) => {
                    self.available = false;
                    return Err(ConnectionError::Disconnected);
                }
                Ok(Ok(_)) => {}
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("available", &self.available)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Spawns a one-shot echo peer that prefixes every received line
    /// with "echo ".
    async fn spawn_echo_peer() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let reply = format!("echo {line}\r\n");
                if write.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn open_write_read_roundtrip() {
        let addr = spawn_echo_peer().await;
        let mut conn = Connection::new("127.0.0.1", addr.port());

        assert!(!conn.is_available());
        conn.open().await.unwrap();
        assert!(conn.is_available());

        conn.write_line("hello").await.unwrap();
        assert_eq!(conn.read_line().await.unwrap(), "echo hello");
    }

    #[tokio::test]
    async fn open_fails_on_refused_port() {
        // bind then drop to get a port that refuses connections
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut conn = Connection::new("127.0.0.1", addr.port());
        let err = conn.open().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Io(_) | ConnectionError::TimedOut
        ));
        assert!(!conn.is_available());
    }

    #[tokio::test]
    async fn peer_close_marks_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut conn = Connection::new("127.0.0.1", addr.port());
        conn.open().await.unwrap();

        let err = conn.read_line().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Disconnected));
        assert!(!conn.is_available());
    }

    #[tokio::test]
    async fn read_times_out_on_silent_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // accept but never reply
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let mut conn = Connection::new("127.0.0.1", addr.port())
            .with_op_timeout(Duration::from_millis(50));
        conn.open().await.unwrap();

        let err = conn.read_line().await.unwrap_err();
        assert!(matches!(err, ConnectionError::TimedOut));
        assert!(!conn.is_available());
    }

    #[tokio::test]
    async fn io_before_open_is_rejected() {
        let mut conn = Connection::new("127.0.0.1", 1);
        assert!(matches!(
            conn.write_line("ping").await.unwrap_err(),
            ConnectionError::NotOpen
        ));
        assert!(matches!(
            conn.read_line().await.unwrap_err(),
            ConnectionError::NotOpen
        ));
    }

    #[tokio::test]
    async fn close_then_reopen() {
        let addr = spawn_echo_peer().await;
        let mut conn = Connection::new("127.0.0.1", addr.port());
        conn.open().await.unwrap();
        conn.close();
        assert!(!conn.is_available());

        // reopening requires a fresh accept
        let addr2 = spawn_echo_peer().await;
        let mut conn = Connection::new("127.0.0.1", addr2.port());
        conn.open().await.unwrap();
        conn.write_line("again").await.unwrap();
        assert_eq!(conn.read_line().await.unwrap(), "echo again");
    }
}
