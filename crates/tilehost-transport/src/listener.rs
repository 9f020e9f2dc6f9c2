//! The listener set: every configured endpoint, bound once, fanned into
//! one stream of accepted connections.
//!
//! Binding is all-or-nothing. If any endpoint fails to bind, the ones
//! already bound are dropped and the error is returned; the server never
//! runs with half its listeners.
//!
//! Each listener gets its own accept task that does nothing but
//! `accept()` and forward the raw socket. The TLS and WebSocket
//! handshakes happen later, in the connection's own task, so a slow
//! client cannot stall the accept path.

use std::net::SocketAddr;

use tilehost_config::{ConfigError, ListenerEndpoint, TlsSettings};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::tls::load_acceptor;

/// Bounded so a flood of connects applies backpressure to the accept
/// tasks instead of growing memory.
const ACCEPT_QUEUE: usize = 256;

/// A raw accepted socket, tagged with the endpoint that accepted it.
pub struct AcceptedConnection {
    pub tcp: TcpStream,
    pub peer: SocketAddr,
    pub endpoint: ListenerEndpoint,
    /// Present when the endpoint is a TLS endpoint.
    pub tls: Option<TlsAcceptor>,
}

impl AcceptedConnection {
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}

/// One bound endpoint and the address the OS actually gave it.
#[derive(Debug, Clone)]
pub struct BoundListener {
    pub endpoint: ListenerEndpoint,
    pub local_addr: SocketAddr,
}

/// Every listener of the server.
pub struct ListenerSet {
    rx: mpsc::Receiver<AcceptedConnection>,
    bound: Vec<BoundListener>,
    tasks: Vec<JoinHandle<()>>,
}

impl ListenerSet {
    /// Binds every endpoint and starts accepting.
    ///
    /// # Errors
    /// [`ConfigError::Bind`] for the first endpoint that fails to bind;
    /// TLS loading errors if a TLS endpoint is present.
    pub async fn bind(
        endpoints: &[ListenerEndpoint],
        tls: Option<&TlsSettings>,
    ) -> Result<Self, ConfigError> {
        if endpoints.is_empty() {
            return Err(ConfigError::NoListeners);
        }

        let acceptor = match (endpoints.iter().any(|e| e.tls), tls) {
            (true, Some(settings)) => Some(load_acceptor(settings)?),
            (true, None) => {
                return Err(ConfigError::MissingTlsMaterial {
                    kind: "certificate",
                    path: Default::default(),
                });
            }
            (false, _) => None,
        };

        // Bind everything before spawning anything so a failure leaves
        // no accept task behind.
        let mut listeners = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let addr = endpoint.bind_addr();
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|source| ConfigError::Bind { addr, source })?;
            let local_addr = listener.local_addr().map_err(|source| ConfigError::Bind {
                addr: endpoint.bind_addr(),
                source,
            })?;
            tracing::info!(%endpoint, %local_addr, "listening");
            listeners.push((listener, BoundListener {
                endpoint: endpoint.clone(),
                local_addr,
            }));
        }

        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE);
        let mut bound = Vec::with_capacity(listeners.len());
        let mut tasks = Vec::with_capacity(listeners.len());
        for (listener, info) in listeners {
            let tls = if info.endpoint.tls { acceptor.clone() } else { None };
            tasks.push(tokio::spawn(accept_loop(
                listener,
                info.endpoint.clone(),
                tls,
                tx.clone(),
            )));
            bound.push(info);
        }

        Ok(Self { rx, bound, tasks })
    }

    /// Waits for the next accepted connection from any endpoint.
    ///
    /// Returns `None` once the set has been shut down.
    pub async fn accept(&mut self) -> Option<AcceptedConnection> {
        self.rx.recv().await
    }

    /// The bound endpoints, in configuration order.
    pub fn bound(&self) -> &[BoundListener] {
        &self.bound
    }

    /// Stops accepting. Connections already accepted are unaffected.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.rx.close();
        tracing::info!("listeners closed");
    }
}

impl Drop for ListenerSet {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    endpoint: ListenerEndpoint,
    tls: Option<TlsAcceptor>,
    tx: mpsc::Sender<AcceptedConnection>,
) {
    loop {
        match listener.accept().await {
            Ok((tcp, peer)) => {
                tracing::debug!(%endpoint, %peer, "accepted");
                let conn = AcceptedConnection {
                    tcp,
                    peer,
                    endpoint: endpoint.clone(),
                    tls: tls.clone(),
                };
                if tx.send(conn).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                // Usually EMFILE or a reset during accept. Back off so a
                // persistent error does not spin.
                tracing::warn!(%endpoint, error = %e, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}
