//! cinder-protocol: control-plane wire protocol for cinder.
//!
//! This crate provides the building blocks the cluster layer uses to talk
//! to remote nodes:
//!
//! - [`Connection`]: a reusable duplex byte stream with explicit open /
//!   is-available / close and CRLF line framing.
//! - [`Ping`]: the liveness probe operation used by node monitoring.
//!
//! The protocol is memcached-style line-oriented text: a request is a
//! single CRLF-terminated line (multi-line payloads end with `END`), and
//! the peer answers with a CRLF-terminated status line such as `OK`.

mod connection;
mod error;
mod ops;

pub use connection::Connection;
pub use error::ConnectionError;
pub use ops::Ping;

/// Canonical success reply line.
pub const REPLY_OK: &str = "OK";

/// Terminator line for multi-line request payloads.
pub const PAYLOAD_END: &str = "END";
