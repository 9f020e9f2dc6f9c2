/// Errors that can occur on an individual connection.
///
/// Listener-level failures at startup are configuration problems and
/// surface as `ConfigError` instead.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection was closed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Receiving data failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// The TLS or WebSocket handshake failed or timed out.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The transport was shut down.
    #[error("transport shut down")]
    Shutdown,
}
