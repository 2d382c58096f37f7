//! Client-side control-plane operations.
//!
//! An operation serializes a request, awaits the response on a
//! [`Connection`], and reports success or failure. Each operation
//! publishes an identifier string so the worker running it can surface
//! the current op in diagnostics.

use crate::connection::Connection;
use crate::error::ConnectionError;
use crate::REPLY_OK;

/// Liveness probe: sends `ping`, expects `OK`.
pub struct Ping<'c> {
    connection: &'c mut Connection,
}

impl<'c> Ping<'c> {
    /// Identifier published while the op is running.
    pub const IDENT: &'static str = "ping";

    /// Binds the operation to a connection.
    pub fn new(connection: &'c mut Connection) -> Self {
        Self { connection }
    }

    /// Runs the probe. Any I/O, timeout, or protocol error is an error;
    /// the caller decides how to account for it.
    pub async fn run_client(self) -> Result<(), ConnectionError> {
        self.connection.write_line(Self::IDENT).await?;
        let reply = self.connection.read_line().await?;
        if reply == REPLY_OK {
            Ok(())
        } else {
            Err(ConnectionError::Protocol(format!(
                "unexpected ping reply: {reply}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Spawns a peer that answers every `ping` with the given reply line.
    async fn spawn_ping_peer(reply: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                assert_eq!(line, "ping");
                let out = format!("{reply}\r\n");
                if write.write_all(out.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn ping_ok() {
        let addr = spawn_ping_peer("OK").await;
        let mut conn = Connection::new("127.0.0.1", addr.port());
        conn.open().await.unwrap();

        Ping::new(&mut conn).run_client().await.unwrap();
        // the connection survives a successful probe
        assert!(conn.is_available());
    }

    #[tokio::test]
    async fn ping_rejects_unexpected_reply() {
        let addr = spawn_ping_peer("SERVER_ERROR busy").await;
        let mut conn = Connection::new("127.0.0.1", addr.port());
        conn.open().await.unwrap();

        let err = Ping::new(&mut conn).run_client().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Protocol(_)));
    }

    #[tokio::test]
    async fn ping_fails_on_closed_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut conn = Connection::new("127.0.0.1", addr.port());
        conn.open().await.unwrap();

        let err = Ping::new(&mut conn).run_client().await.unwrap_err();
        // either the write or the read observes the close first
        assert!(matches!(
            err,
            ConnectionError::Disconnected | ConnectionError::Io(_)
        ));
        assert!(!conn.is_available());
    }
}
