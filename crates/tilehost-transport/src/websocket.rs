//! WebSocket connections over plain TCP or TLS.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::{AcceptedConnection, Connection, ConnectionId, TransportError};

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Any byte stream a WebSocket can run over.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

type WsStream = WebSocketStream<Box<dyn Io>>;

impl AcceptedConnection {
    /// Runs the TLS handshake (for TLS endpoints) and the WebSocket
    /// handshake, both bounded by `timeout`.
    pub async fn upgrade(self, timeout: Duration) -> Result<WebSocketConnection, TransportError> {
        let peer = self.peer;
        let secure = self.tls.is_some();

        let handshake = async move {
            let io: Box<dyn Io> = match self.tls {
                Some(acceptor) => Box::new(
                    acceptor
                        .accept(self.tcp)
                        .await
                        .map_err(|e| TransportError::Handshake(format!("tls: {e}")))?,
                ),
                None => Box::new(self.tcp),
            };
            tokio_tungstenite::accept_async(io)
                .await
                .map_err(|e| TransportError::Handshake(format!("websocket: {e}")))
        };

        let ws = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| TransportError::Handshake("timed out".to_string()))??;

        let id = ConnectionId::new(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(%id, %peer, secure, "WebSocket connection established");
        Ok(WebSocketConnection::new(id, peer, secure, ws))
    }
}

/// A single WebSocket connection.
///
/// The sink and the stream sit behind separate locks, so one task can
/// block in [`recv`](Connection::recv) while others keep sending game
/// output.
pub struct WebSocketConnection {
    id: ConnectionId,
    peer: SocketAddr,
    secure: bool,
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
}

impl WebSocketConnection {
    fn new(id: ConnectionId, peer: SocketAddr, secure: bool, ws: WsStream) -> Self {
        let (sink, stream) = ws.split();
        Self {
            id,
            peer,
            secure,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the connection arrived on a TLS endpoint.
    pub fn is_secure(&self) -> bool {
        self.secure
    }
}

fn send_error(e: impl std::error::Error + Send + Sync + 'static) -> TransportError {
    TransportError::SendFailed(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))
}

impl Connection for WebSocketConnection {
    type Error = TransportError;

    async fn send(&self, data: &[u8]) -> Result<(), Self::Error> {
        // Browsers expect JSON as text frames.
        let msg = match std::str::from_utf8(data) {
            Ok(text) => Message::Text(text.to_owned().into()),
            Err(_) => Message::Binary(data.to_vec().into()),
        };
        self.sink.lock().await.send(msg).await.map_err(send_error)
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        loop {
            let msg = self.stream.lock().await.next().await;
            match msg {
                Some(Ok(Message::Binary(data))) => return Ok(Some(data.into())),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_bytes().to_vec())),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue, // ping/pong/frame
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        e,
                    )));
                }
            }
        }
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.sink.lock().await.close().await.map_err(send_error)
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}
