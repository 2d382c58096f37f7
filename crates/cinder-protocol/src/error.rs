//! Error types for connection and operation failures.

/// Errors that can occur while talking to a remote node.
///
/// All of these are non-fatal from the caller's point of view: the
/// connection is marked unavailable and may be reopened on demand.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The underlying socket operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation did not complete within the per-operation timeout.
    #[error("operation timed out")]
    TimedOut,

    /// The peer closed the connection.
    #[error("peer closed the connection")]
    Disconnected,

    /// The connection has not been opened (or was closed).
    #[error("connection is not open")]
    NotOpen,

    /// The peer sent something we could not understand.
    #[error("protocol error: {0}")]
    Protocol(String),
}
