//! Network edge of Tilehost.
//!
//! - [`ListenerSet`] binds every configured endpoint (plain and TLS) and
//!   yields raw [`AcceptedConnection`]s tagged with their endpoint.
//! - [`AcceptedConnection::upgrade`] runs the TLS and WebSocket
//!   handshakes, producing a [`WebSocketConnection`].
//! - [`Connection`] is the trait the handler talks to, so tests and
//!   future transports can stand in for WebSockets.
//!
//! # Feature Flags
//!
//! - `websocket` (default): WebSocket connections via `tokio-tungstenite`

#![allow(async_fn_in_trait)]

mod error;
mod listener;
mod tls;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
pub use listener::{AcceptedConnection, BoundListener, ListenerSet};
pub use tls::load_acceptor;
#[cfg(feature = "websocket")]
pub use websocket::{Io, WebSocketConnection};

use std::fmt;

/// Opaque identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
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

/// A single client connection that can send and receive messages.
///
/// `send` and `recv` may be called concurrently from different tasks.
pub trait Connection: Send + Sync + 'static {
    /// The error type for connection operations.
    type Error: std::error::Error + Send + Sync;

    /// Sends one message to the remote peer.
    async fn send(&self, data: &[u8]) -> Result<(), Self::Error>;

    /// Receives the next message from the remote peer.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed.
    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Closes the connection.
    async fn close(&self) -> Result<(), Self::Error>;

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::new(7).to_string(), "conn-7");
    }

    #[test]
    fn test_connection_id_hash_works_as_map_key() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(ConnectionId::new(1), "alice");
        map.insert(ConnectionId::new(2), "bob");
        assert_eq!(map[&ConnectionId::new(1)], "alice");
        assert_eq!(ConnectionId::new(2).into_inner(), 2);
    }
}
