//! Transport abstraction layer for chatgate.
//!
//! Provides the [`Transport`] and [`Connection`] traits that abstract over
//! the network protocol carrying the real-time endpoint, plus the
//! [`UpgradeRequest`] describing what the client presented when it opened
//! the connection (endpoint path and bearer token).
//!
//! # Feature Flags
//!
//! - `websocket` (default) — WebSocket transport via `tokio-tungstenite`

#![allow(async_fn_in_trait)]

mod error;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConnection, WebSocketTransport, WebSocketUpgrade};

use std::fmt;
use std::net::SocketAddr;

/// Opaque identifier for a connection.
///
/// Generated once, at accept time, and never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What the client sent along with its upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Request path of the upgrade (always the configured endpoint once
    /// the upgrade succeeded).
    pub path: String,
    /// Bearer token from the `Authorization` header or, failing that, the
    /// `access_token` query parameter.
    pub bearer_token: Option<String>,
    /// Remote address of the peer, when known.
    pub peer_addr: Option<SocketAddr>,
}

/// Extracts the token from an `Authorization` header value.
///
/// Accepts both `Bearer` and `bearer` schemes. Returns `None` for any other
/// scheme or an empty token.
pub fn extract_bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Extracts the `access_token` parameter from a raw query string.
pub fn extract_query_token(query: &str) -> Option<&str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "access_token")
        .map(|(_, value)| value)
        .filter(|t| !t.is_empty())
}

/// Accepts new incoming connections.
pub trait Transport: Send + Sync + 'static {
    /// An accepted but not yet upgraded connection.
    type Incoming: Send + 'static;
    /// The error type for transport operations.
    type Error: std::error::Error + Send + Sync;

    /// Waits for and accepts the next incoming connection.
    ///
    /// Only the network-level accept happens here; the protocol upgrade is
    /// left to the caller so a slow client never stalls the accept loop.
    async fn accept(&mut self) -> Result<Self::Incoming, Self::Error>;

    /// Gracefully shuts down the transport, stopping new connections.
    async fn shutdown(&self) -> Result<(), Self::Error>;
}

/// A single connection that can send and receive bytes.
///
/// Sending and receiving are independent: one task may be parked in
/// [`recv`](Connection::recv) while another calls [`send`](Connection::send).
pub trait Connection: Send + Sync + 'static {
    /// The error type for connection operations.
    type Error: std::error::Error + Send + Sync;

    /// Sends data to the remote peer.
    async fn send(&self, data: &[u8]) -> Result<(), Self::Error>;

    /// Receives the next message from the remote peer.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed.
    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Closes the connection.
    async fn close(&self) -> Result<(), Self::Error>;

    /// Closes the connection, telling the peer why.
    ///
    /// Defaults to a plain close. Transports with a close-reason field
    /// (WebSocket close frames) should override this.
    async fn close_with_reason(&self, reason: &str) -> Result<(), Self::Error> {
        let _ = reason;
        self.close().await
    }

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;
}
