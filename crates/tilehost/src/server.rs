//! `TilehostServer` builder and server loop.
//!
//! This is the entry point for running a Tilehost server. It ties
//! together all the layers: listeners → handler → sessions → processes,
//! plus the idle monitor and milestone ingestion running alongside.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tilehost_config::ServerConfig;
use tilehost_monitor::{IdleMonitor, MonitorConfig, MonitorEvent, StatusFile};
use tilehost_process::{ProcessHandle, ProcessSupervisor, SupervisorConfig, TerminationReason};
use tilehost_protocol::{Codec, JsonCodec};
use tilehost_record::MilestoneTail;
use tilehost_session::{CredentialStore, SessionId, SessionRegistry};
use tilehost_transport::ListenerSet;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::handler::handle_connection;
use crate::TilehostError;

/// How often the milestone file is checked for new lines.
const MILESTONE_POLL: Duration = Duration::from_secs(1);

/// Extra time granted on shutdown beyond the kill timeout.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(5);

/// Shared server state passed to each connection handler task.
pub(crate) struct ServerState<C: Codec> {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) credentials: CredentialStore,
    pub(crate) supervisor: ProcessSupervisor,
    pub(crate) codec: C,
    /// Flips to `true` once every game has been stopped on shutdown.
    pub(crate) closing: watch::Receiver<bool>,
}

/// Builder for configuring and starting a Tilehost server.
///
/// ```rust,ignore
/// let config = ServerConfig::load(Path::new("tilehost.toml"))?;
/// let server = TilehostServer::builder(config).build().await?;
/// server.run().await
/// ```
pub struct TilehostServerBuilder {
    config: ServerConfig,
    supervisor: Option<SupervisorConfig>,
    monitor: Option<MonitorConfig>,
    handshake_timeout: Duration,
}

impl TilehostServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            supervisor: None,
            monitor: None,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    /// Overrides the process settings derived from the configuration.
    pub fn supervisor_config(mut self, config: SupervisorConfig) -> Self {
        self.supervisor = Some(config);
        self
    }

    /// Overrides the monitor settings derived from the configuration.
    pub fn monitor_config(mut self, config: MonitorConfig) -> Self {
        self.monitor = Some(config);
        self
    }

    /// Bound on the TLS plus WebSocket handshake of each connection.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Binds every listener and opens the password database.
    ///
    /// # Errors
    /// A bind or TLS failure ([`TilehostError::Config`]) or an unreadable
    /// password database.
    pub async fn build(self) -> Result<TilehostServer<JsonCodec>, TilehostError> {
        let config = Arc::new(self.config);
        let listeners = ListenerSet::bind(config.endpoints(), config.tls.as_ref()).await?;
        let credentials = CredentialStore::open(
            &config.auth,
            config.nick_policy().clone(),
            config.token_lifetime(),
        )
        .await?;

        let supervisor = ProcessSupervisor::new(
            self.supervisor
                .unwrap_or_else(|| supervisor_config(&config)),
        );
        let monitor = IdleMonitor::new(
            self.monitor
                .unwrap_or_else(|| MonitorConfig::from_settings(&config.server)),
        );
        let (closing_tx, closing_rx) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);

        let state = Arc::new(ServerState {
            registry: Arc::new(SessionRegistry::new(config.server.max_connections)),
            config,
            credentials,
            supervisor,
            codec: JsonCodec,
            closing: closing_rx,
        });

        Ok(TilehostServer {
            listeners,
            state,
            monitor,
            shutdown: Arc::new(shutdown_tx),
            closing: closing_tx,
            handshake_timeout: self.handshake_timeout,
        })
    }
}

/// Process settings derived from the configuration file.
pub fn supervisor_config(config: &ServerConfig) -> SupervisorConfig {
    SupervisorConfig {
        kill_timeout: config.server.kill_timeout(),
        connect_timeout: config.server.spawn_timeout(),
        server_socket_path: config.server.server_socket_path.clone(),
        term_size: config.recording.term_size,
        init_player_program: config.server.init_player_program.clone(),
        ..SupervisorConfig::default()
    }
}

/// Asks a running server to shut down. Cheap to clone.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

/// A bound Tilehost server.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct TilehostServer<C: Codec> {
    listeners: ListenerSet,
    state: Arc<ServerState<C>>,
    monitor: IdleMonitor,
    shutdown: Arc<watch::Sender<bool>>,
    closing: watch::Sender<bool>,
    handshake_timeout: Duration,
}

impl TilehostServer<JsonCodec> {
    pub fn builder(config: ServerConfig) -> TilehostServerBuilder {
        TilehostServerBuilder::new(config)
    }
}

impl<C: Codec + 'static> TilehostServer<C> {
    /// The addresses the listeners actually bound, in configuration order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.bound().iter().map(|b| b.local_addr).collect()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.state.registry)
    }

    pub fn monitor_events(&self) -> broadcast::Receiver<MonitorEvent> {
        self.monitor.subscribe()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown))
    }

    /// Runs the accept loop until shut down.
    ///
    /// Shutdown order: stop accepting, stop every game (graceful, bounded
    /// by the kill timeout), close the remaining connections, stop the
    /// background tasks, save the password database.
    pub async fn run(mut self) -> Result<(), TilehostError> {
        let mut shutdown = self.shutdown.subscribe();
        let (background_tx, background_rx) = watch::channel(false);

        let registry = Arc::clone(&self.state.registry);
        let monitor_task = tokio::spawn(self.monitor.run(Arc::clone(&registry), background_rx.clone()));
        let milestone_task = self.state.config.recording.milestone_file.clone().map(|path| {
            let tail = MilestoneTail::new(path, MILESTONE_POLL);
            tokio::spawn(tail.run(Arc::clone(&registry), background_rx.clone()))
        });
        let status_task = self.state.config.server.status_file.clone().map(|path| {
            let status = StatusFile::new(path, self.state.config.server.status_file_update_rate());
            tokio::spawn(status.run(Arc::clone(&registry), background_rx.clone()))
        });

        info!(
            server_id = %self.state.config.server.server_id,
            listeners = self.listeners.bound().len(),
            games = self.state.config.games().len(),
            "Tilehost server running"
        );

        // A trigger that arrived before `run` is already marked seen.
        let mut stopping = *shutdown.borrow();
        while !stopping {
            tokio::select! {
                accepted = self.listeners.accept() => {
                    let Some(accepted) = accepted else { break };
                    let state = Arc::clone(&self.state);
                    let timeout = self.handshake_timeout;
                    // The handshake runs in the connection's own task so a
                    // slow client never holds up the accept path.
                    tokio::spawn(async move {
                        let peer = accepted.peer;
                        let conn = match accepted.upgrade(timeout).await {
                            Ok(conn) => conn,
                            Err(e) => {
                                debug!(%peer, error = %e, "handshake failed");
                                return;
                            }
                        };
                        if let Err(e) = handle_connection(conn, state).await {
                            debug!(%peer, error = %e, "connection ended with error");
                        }
                    });
                }
                changed = shutdown.changed() => {
                    stopping = changed.is_err() || *shutdown.borrow();
                }
            }
        }

        info!("shutting down");
        self.listeners.shutdown();
        stop_all_games(&registry, self.state.supervisor.config().kill_timeout).await;
        self.closing.send_replace(true);
        background_tx.send_replace(true);

        if let Err(e) = monitor_task.await {
            warn!(error = %e, "monitor task failed");
        }
        if let Some(task) = milestone_task {
            if let Err(e) = task.await {
                warn!(error = %e, "milestone task failed");
            }
        }
        if let Some(task) = status_task {
            if let Err(e) = task.await {
                warn!(error = %e, "status file task failed");
            }
        }
        if let Err(e) = self.state.credentials.flush().await {
            error!(error = %e, "password database not saved on shutdown");
        }
        info!("shutdown complete");
        Ok(())
    }
}

/// Gracefully terminates every live game and waits, at most the kill
/// timeout plus a little slack, for all of them.
async fn stop_all_games(registry: &SessionRegistry, kill_timeout: Duration) {
    let mut set = JoinSet::new();
    for session in registry.sessions() {
        if let Some(handle) = session.process().cloned() {
            set.spawn(async move { handle.terminate(true, TerminationReason::Shutdown).await });
        }
    }
    if set.is_empty() {
        return;
    }
    info!(games = set.len(), "stopping games");
    let all = async { while set.join_next().await.is_some() {} };
    if tokio::time::timeout(kill_timeout + SHUTDOWN_SLACK, all).await.is_err() {
        warn!("some games did not stop in time");
    }
}

/// Removes the session once its game exits, whether or not anyone is
/// attached.
pub(crate) fn reap_on_exit(registry: Arc<SessionRegistry>, id: SessionId, handle: ProcessHandle) {
    tokio::spawn(async move {
        let state = handle.wait_exit().await;
        if registry.remove(&id).is_some() {
            info!(session_id = %id, %state, "game ended; session removed");
        }
    });
}
