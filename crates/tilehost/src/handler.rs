//! Per-connection handler: authentication, lobby, play, watch, relay.
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The connection is in one of three modes:
//!
//! ```text
//!            play ─────────▶ Playing ──game ends / go_lobby──┐
//! Lobby ─┤                                                   ├──▶ Lobby
//!            watch ────────▶ Watching ──game ends / stop─────┘
//! ```
//!
//! Game output reaches the connection through a bounded channel fed by
//! the process actor. A client that falls too far behind is dropped by
//! the actor and its connection closed here; the game is not affected.

use std::sync::Arc;

use tilehost_config::{ReconnectPolicy, Username};
use tilehost_process::{
    LaunchRequest, ProcessExit, ProcessHandle, ProcessState, TerminationReason, ViewerEvent,
    ViewerId, ViewerRole,
};
use tilehost_protocol::{
    ClientMessage, Codec, EndReason, ErrorCode, GameInfo, LobbyEntry, ServerMessage, Utf8Carry,
};
use tilehost_session::{Admission, Session, SessionError};
use tilehost_transport::{Connection, WebSocketConnection};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::server::{reap_on_exit, ServerState};
use crate::TilehostError;

/// What the connection is currently doing.
enum Mode {
    Lobby,
    Playing(Attached),
    Watching(Attached),
}

/// A viewer attachment to a running game.
struct Attached {
    session: Arc<Session>,
    handle: ProcessHandle,
    events: mpsc::Receiver<ViewerEvent>,
    carry: Utf8Carry,
    kicks: watch::Receiver<u64>,
}

enum ModeEvent {
    Event(ViewerEvent),
    /// The actor dropped this viewer: either it fell behind, or the
    /// actor went away without a final event.
    Lost,
    /// The monitor asked for this connection to close.
    Kicked,
}

impl Mode {
    /// Next event from the attached game. Pends forever in the lobby.
    async fn next_event(&mut self) -> ModeEvent {
        let playing = matches!(self, Mode::Playing(_));
        let attached = match self {
            Mode::Playing(a) | Mode::Watching(a) => a,
            Mode::Lobby => return std::future::pending().await,
        };
        tokio::select! {
            event = attached.events.recv() => match event {
                Some(event) => ModeEvent::Event(event),
                None => ModeEvent::Lost,
            },
            changed = attached.kicks.changed(), if playing => match changed {
                Ok(()) => ModeEvent::Kicked,
                Err(_) => std::future::pending().await,
            },
        }
    }
}

/// Per-connection state.
struct Client<'a, C: Codec> {
    conn: &'a WebSocketConnection,
    state: &'a ServerState<C>,
    viewer: ViewerId,
    username: Option<Username>,
    failures: u32,
    /// Set when the connection is closed for silence or for falling
    /// behind. Such a connection only detaches, whatever the reconnect
    /// policy.
    detach_only: bool,
    mode: Mode,
}

/// Whether the loop keeps going after a message.
enum Flow {
    Continue,
    Close,
}

/// Handles a single connection from upgrade to close.
pub(crate) async fn handle_connection<C: Codec>(
    conn: WebSocketConnection,
    state: Arc<ServerState<C>>,
) -> Result<(), TilehostError> {
    let conn_id = conn.id();
    debug!(%conn_id, peer = %conn.peer(), secure = conn.is_secure(), "handling new connection");

    let mut client = Client {
        conn: &conn,
        state: &state,
        viewer: ViewerId(conn_id.into_inner()),
        username: None,
        failures: 0,
        detach_only: false,
        mode: Mode::Lobby,
    };
    let result = client.run().await;
    let lost = !client.detach_only;
    client.leave(lost).await;
    let _ = conn.close().await;
    debug!(%conn_id, "connection closed");
    result
}

impl<C: Codec> Client<'_, C> {
    async fn run(&mut self) -> Result<(), TilehostError> {
        let timeout = self.state.config.server.connection_timeout();
        let mut closing = self.state.closing.clone();
        let conn_id = self.conn.id();

        // Only client traffic pushes the deadline back; game output does not.
        let mut silent_until = Instant::now() + timeout;

        loop {
            // Every branch future is dropped before the handlers below
            // run, so they are free to change `self.mode`.
            tokio::select! {
                received = self.conn.recv() => {
                    let data = match received {
                        Ok(Some(data)) => data,
                        Ok(None) => {
                            debug!(%conn_id, "connection closed by client");
                            return Ok(());
                        }
                        Err(e) => {
                            debug!(%conn_id, error = %e, "recv error");
                            return Ok(());
                        }
                    };
                    silent_until = Instant::now() + timeout;
                    if let Mode::Playing(a) = &self.mode {
                        a.session.touch_seen();
                    }
                    let msg: ClientMessage = match self.state.codec.decode(&data) {
                        Ok(msg) => msg,
                        Err(e) => {
                            debug!(%conn_id, error = %e, "undecodable message");
                            self.send(&ServerMessage::error(ErrorCode::BadRequest, "malformed message"))
                                .await?;
                            continue;
                        }
                    };
                    if let Flow::Close = self.dispatch(msg).await? {
                        return Ok(());
                    }
                }
                event = self.mode.next_event() => {
                    if let Flow::Close = self.on_mode_event(event).await? {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep_until(silent_until) => {
                    info!(
                        %conn_id,
                        timeout_secs = timeout.as_secs(),
                        "connection timed out"
                    );
                    self.detach_only = true;
                    return Ok(());
                }
                changed = closing.changed() => {
                    if changed.is_err() || *closing.borrow() {
                        debug!(%conn_id, "server closing; dropping connection");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn send(&self, msg: &ServerMessage) -> Result<(), TilehostError> {
        let bytes = self.state.codec.encode(msg)?;
        self.conn.send(&bytes).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Client messages
    // -----------------------------------------------------------------------

    async fn dispatch(&mut self, msg: ClientMessage) -> Result<Flow, TilehostError> {
        match msg {
            ClientMessage::Login {
                username,
                password,
                remember,
            } => return self.login(username, password, remember).await,
            ClientMessage::TokenLogin { token } => return self.token_login(token).await,
            ClientMessage::Register { username, password } => {
                self.register(username, password).await?;
            }
            ClientMessage::ChangePassword {
                current_password,
                new_password,
            } => return self.change_password(current_password, new_password).await,
            ClientMessage::Logout { token } => self.logout(token).await?,
            ClientMessage::ListGames => self.send_game_list().await?,
            ClientMessage::Play { game_id } => self.play(game_id).await?,
            ClientMessage::Watch { username } => self.watch(username).await?,
            ClientMessage::StopWatching => {
                if let Mode::Watching(_) = self.mode {
                    self.leave(false).await;
                    self.send(&ServerMessage::WatchingStopped).await?;
                    self.send_lobby().await?;
                }
            }
            ClientMessage::Input { data } => self.input(data).await?,
            ClientMessage::GoLobby => {
                self.leave(false).await;
                self.send_lobby().await?;
            }
            ClientMessage::Heartbeat => self.send(&ServerMessage::HeartbeatAck).await?,
        }
        Ok(Flow::Continue)
    }

    /// Counts a failed authentication. Closes the connection once the
    /// limit is reached.
    async fn auth_failed(&mut self) -> Result<Flow, TilehostError> {
        self.failures += 1;
        self.send(&ServerMessage::LoginFail).await?;
        let limit = self.state.config.server.max_login_failures;
        if limit > 0 && self.failures >= limit {
            warn!(
                conn_id = %self.conn.id(),
                peer = %self.conn.peer(),
                failures = self.failures,
                "too many failed logins; closing connection"
            );
            return Ok(Flow::Close);
        }
        Ok(Flow::Continue)
    }

    async fn logged_in(&mut self, username: Username, token: Option<String>) -> Result<(), TilehostError> {
        info!(conn_id = %self.conn.id(), %username, "player logged in");
        self.failures = 0;
        self.send(&ServerMessage::LoginSuccess {
            username: username.to_string(),
            token,
        })
        .await?;
        self.username = Some(username);
        self.send_lobby().await
    }

    async fn login(&mut self, username: String, password: String, remember: bool) -> Result<Flow, TilehostError> {
        let state = self.state;
        let credentials = &state.credentials;
        let parsed = credentials.policy().parse(&username).ok();
        // Verify even for unparseable names so every failure costs the same.
        let ok = credentials.verify(&username, &password).await;
        let Some(name) = parsed.filter(|_| ok) else {
            debug!(conn_id = %self.conn.id(), "password login failed");
            return self.auth_failed().await;
        };

        let token = if remember {
            match credentials.issue_token(name.as_str()).await {
                Ok(t) => Some(t.token),
                Err(e) => {
                    warn!(username = %name, error = %e, "login token not issued");
                    None
                }
            }
        } else {
            None
        };
        self.logged_in(name, token).await?;
        Ok(Flow::Continue)
    }

    async fn token_login(&mut self, token: String) -> Result<Flow, TilehostError> {
        let state = self.state;
        let credentials = &state.credentials;
        let fresh = match credentials.redeem_token(&token).await {
            Ok(fresh) => fresh,
            Err(e) => {
                debug!(conn_id = %self.conn.id(), error = %e, "token login failed");
                return self.auth_failed().await;
            }
        };
        let Ok(name) = credentials.policy().parse(&fresh.username) else {
            return self.auth_failed().await;
        };
        self.logged_in(name, Some(fresh.token)).await?;
        Ok(Flow::Continue)
    }

    async fn register(&mut self, username: String, password: String) -> Result<(), TilehostError> {
        match self.state.credentials.register(&username, &password).await {
            Ok(name) => self.logged_in(name, None).await,
            Err(e) => {
                debug!(conn_id = %self.conn.id(), error = %e, "registration refused");
                self.send(&ServerMessage::RegisterFail {
                    reason: e.to_string(),
                })
                .await
            }
        }
    }

    async fn change_password(&mut self, current: String, new: String) -> Result<Flow, TilehostError> {
        let Some(name) = self.username.clone() else {
            self.send(&ServerMessage::error(ErrorCode::Unauthorized, "log in first"))
                .await?;
            return Ok(Flow::Continue);
        };
        match self
            .state
            .credentials
            .change_password(name.as_str(), &current, &new)
            .await
        {
            Ok(()) => {
                self.send(&ServerMessage::PasswordChanged).await?;
                Ok(Flow::Continue)
            }
            Err(SessionError::AuthFailed) => self.auth_failed().await,
            Err(e) => {
                self.send(&ServerMessage::error(ErrorCode::BadRequest, e.to_string()))
                    .await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn logout(&mut self, token: Option<String>) -> Result<(), TilehostError> {
        if let Some(token) = token {
            if let Err(e) = self.state.credentials.forget_token(&token).await {
                warn!(error = %e, "login token not forgotten");
            }
        }
        self.leave(true).await;
        if let Some(name) = self.username.take() {
            info!(conn_id = %self.conn.id(), username = %name, "player logged out");
        }
        self.send(&ServerMessage::LoggedOut).await
    }

    async fn play(&mut self, game_id: String) -> Result<(), TilehostError> {
        let Some(username) = self.username.clone() else {
            return self
                .send(&ServerMessage::error(ErrorCode::Unauthorized, "log in first"))
                .await;
        };
        if let Mode::Playing(_) = self.mode {
            return self
                .send(&ServerMessage::error(ErrorCode::Conflict, "already playing"))
                .await;
        }
        let Some(game) = self.state.config.games().get(&game_id).cloned() else {
            return self
                .send(&ServerMessage::error(ErrorCode::NotFound, format!("no game {game_id}")))
                .await;
        };
        self.leave(false).await;

        let registry = &self.state.registry;
        let admission = match registry.admit(&username, &game, self.viewer) {
            Ok(a) => a,
            Err(e) => {
                let code = match e {
                    SessionError::CapacityExceeded { .. } => ErrorCode::Unavailable,
                    SessionError::AlreadyPlaying(_) => ErrorCode::Conflict,
                    _ => ErrorCode::Internal,
                };
                info!(%username, game = %game.id, error = %e, "admission refused");
                return self.send(&ServerMessage::error(code, e.to_string())).await;
            }
        };

        let session = Arc::clone(admission.session());
        let handle = match &admission {
            Admission::Resumed(_) => match session.process().cloned() {
                Some(handle) => handle,
                None => {
                    session.detach(self.viewer);
                    return self
                        .send(&ServerMessage::error(ErrorCode::Conflict, "game is still starting"))
                        .await;
                }
            },
            Admission::New(_) => {
                let request = LaunchRequest {
                    session_id: session.id().to_string(),
                    username: username.clone(),
                    game: Arc::clone(&game),
                };
                match self.state.supervisor.spawn(request).await {
                    Ok(handle) => {
                        session.set_process(handle.clone());
                        reap_on_exit(Arc::clone(registry), session.id().clone(), handle.clone());
                        handle
                    }
                    Err(e) => {
                        registry.remove(session.id());
                        warn!(%username, game = %game.id, error = %e, "game failed to start");
                        return self
                            .send(&ServerMessage::error(ErrorCode::Internal, "cannot start game"))
                            .await;
                    }
                }
            }
        };

        let (tx, rx) = mpsc::channel(self.state.supervisor.config().viewer_buffer);
        if let Err(e) = handle.attach(self.viewer, ViewerRole::Player, tx).await {
            session.detach(self.viewer);
            return self
                .send(&ServerMessage::error(ErrorCode::Internal, e.to_string()))
                .await;
        }
        session.touch_input();

        let paths = game.resolve(&username);
        self.send(&ServerMessage::GameStarted {
            game_id: game.id.clone(),
            session_id: session.id().to_string(),
            client_path: game.client_path.clone(),
            morgue_url: paths.morgue_url,
            send_json_options: game.send_json_options,
            resumed: admission.is_resumed(),
        })
        .await?;
        self.mode = Mode::Playing(Attached {
            kicks: session.disconnect_requests(),
            session,
            handle,
            events: rx,
            carry: Utf8Carry::new(),
        });
        Ok(())
    }

    async fn watch(&mut self, target: String) -> Result<(), TilehostError> {
        if let Mode::Playing(_) = self.mode {
            return self
                .send(&ServerMessage::error(ErrorCode::Conflict, "leave your game first"))
                .await;
        }
        let found = self
            .state
            .registry
            .find_by_username(&target)
            .and_then(|s| s.process().cloned().map(|h| (s, h)));
        let Some((session, handle)) = found.filter(|(_, h)| h.state().is_running()) else {
            return self
                .send(&ServerMessage::error(ErrorCode::NotFound, format!("{target} is not playing")))
                .await;
        };
        self.leave(false).await;

        let (tx, rx) = mpsc::channel(self.state.supervisor.config().viewer_buffer);
        if let Err(e) = handle.attach(self.viewer, ViewerRole::Spectator, tx).await {
            return self
                .send(&ServerMessage::error(ErrorCode::NotFound, e.to_string()))
                .await;
        }
        session.add_spectator();
        debug!(conn_id = %self.conn.id(), target = %session.username(), "spectating");
        self.send(&ServerMessage::WatchingStarted {
            username: session.username().to_string(),
            game_id: session.game().id.clone(),
        })
        .await?;
        self.mode = Mode::Watching(Attached {
            kicks: session.disconnect_requests(),
            session,
            handle,
            events: rx,
            carry: Utf8Carry::new(),
        });
        Ok(())
    }

    async fn input(&mut self, data: String) -> Result<(), TilehostError> {
        let Mode::Playing(a) = &self.mode else {
            return self
                .send(&ServerMessage::error(ErrorCode::BadRequest, "not playing"))
                .await;
        };
        a.session.touch_input();
        if let Err(e) = a.handle.send_input(data.into_bytes()).await {
            debug!(session_id = %a.session.id(), error = %e, "input dropped");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Game events
    // -----------------------------------------------------------------------

    async fn on_mode_event(&mut self, event: ModeEvent) -> Result<Flow, TilehostError> {
        match event {
            ModeEvent::Event(ViewerEvent::Output(bytes)) => {
                let text = match &mut self.mode {
                    Mode::Playing(a) | Mode::Watching(a) => a.carry.push(&bytes),
                    Mode::Lobby => return Ok(Flow::Continue),
                };
                if !text.is_empty() {
                    self.send(&ServerMessage::Output { data: text }).await?;
                }
                Ok(Flow::Continue)
            }
            ModeEvent::Event(ViewerEvent::Ended(exit)) => self.game_ended(exit).await,
            ModeEvent::Lost => {
                let state = match &self.mode {
                    Mode::Playing(a) | Mode::Watching(a) => a.handle.state(),
                    Mode::Lobby => return Ok(Flow::Continue),
                };
                if state.is_running() {
                    warn!(conn_id = %self.conn.id(), "viewer fell behind game output; closing connection");
                    self.detach_only = true;
                    return Ok(Flow::Close);
                }
                self.game_ended(ProcessExit {
                    state,
                    reason: None,
                    code: None,
                })
                .await
            }
            ModeEvent::Kicked => {
                info!(conn_id = %self.conn.id(), "closing silent connection at monitor request");
                self.detach_only = true;
                Ok(Flow::Close)
            }
        }
    }

    /// Tells the viewer how the game ended. A player whose game crashed
    /// is disconnected; everyone else goes back to the lobby.
    async fn game_ended(&mut self, exit: ProcessExit) -> Result<Flow, TilehostError> {
        let mode = std::mem::replace(&mut self.mode, Mode::Lobby);
        let (mut attached, was_player) = match mode {
            Mode::Playing(a) => (a, true),
            Mode::Watching(a) => (a, false),
            Mode::Lobby => return Ok(Flow::Continue),
        };

        let tail = attached.carry.finish();
        if !tail.is_empty() {
            self.send(&ServerMessage::Output { data: tail }).await?;
        }
        if was_player {
            self.state.registry.remove(attached.session.id());
        } else {
            attached.session.remove_spectator();
        }

        let reason = end_reason(&exit);
        info!(
            conn_id = %self.conn.id(),
            session_id = %attached.session.id(),
            username = %attached.session.username(),
            %reason,
            code = ?exit.code,
            "game ended"
        );
        self.send(&ServerMessage::GameEnded { reason }).await?;

        if was_player && exit.state == ProcessState::ExitedCrashed && exit.reason.is_none() {
            return Ok(Flow::Close);
        }
        self.send_lobby().await?;
        Ok(Flow::Continue)
    }

    /// Drops the current attachment, if any. The game keeps running
    /// unless `connection_lost` and the reconnect policy say otherwise.
    async fn leave(&mut self, connection_lost: bool) {
        match std::mem::replace(&mut self.mode, Mode::Lobby) {
            Mode::Lobby => {}
            Mode::Watching(a) => {
                a.handle.detach(self.viewer).await;
                a.session.remove_spectator();
            }
            Mode::Playing(a) => {
                a.handle.detach(self.viewer).await;
                a.session.detach(self.viewer);
                let terminate = connection_lost
                    && self.state.config.server.reconnect_policy == ReconnectPolicy::Terminate;
                info!(
                    session_id = %a.session.id(),
                    username = %a.session.username(),
                    terminate,
                    "player detached"
                );
                if terminate {
                    let handle = a.handle.clone();
                    tokio::spawn(async move {
                        handle.terminate(true, TerminationReason::ConnectionLost).await;
                    });
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Listings
    // -----------------------------------------------------------------------

    async fn send_game_list(&self) -> Result<(), TilehostError> {
        let games = self
            .state
            .config
            .games()
            .iter()
            .map(|g| GameInfo {
                id: g.id.clone(),
                name: g.name.clone(),
            })
            .collect();
        self.send(&ServerMessage::GameList { games }).await
    }

    async fn send_lobby(&self) -> Result<(), TilehostError> {
        let entries = lobby_entries(&self.state.registry.snapshot(), Instant::now());
        self.send(&ServerMessage::Lobby { entries }).await
    }
}

/// Running games only, in username order.
fn lobby_entries(snapshots: &[tilehost_session::SessionSnapshot], now: Instant) -> Vec<LobbyEntry> {
    snapshots
        .iter()
        .filter(|s| s.process_state.is_some_and(ProcessState::is_running))
        .map(|s| LobbyEntry {
            username: s.username.clone(),
            game_id: s.game_id.clone(),
            idle_secs: s.idle_for(now).as_secs(),
            spectators: s.spectators,
            attached: s.is_attached(),
            milestone: s.milestone.clone(),
        })
        .collect()
}

fn end_reason(exit: &ProcessExit) -> EndReason {
    match (exit.reason, exit.state) {
        (Some(TerminationReason::Idle), _) => EndReason::Idle,
        (Some(TerminationReason::Shutdown), _) => EndReason::Shutdown,
        (Some(_), _) => EndReason::Terminated,
        (None, ProcessState::ExitedCrashed) => EndReason::Crashed,
        (None, _) => EndReason::Exited,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_reason_prefers_termination_reason() {
        let exit = |state, reason| ProcessExit {
            state,
            reason,
            code: None,
        };
        assert_eq!(end_reason(&exit(ProcessState::ExitedClean, None)), EndReason::Exited);
        assert_eq!(end_reason(&exit(ProcessState::ExitedCrashed, None)), EndReason::Crashed);
        assert_eq!(
            end_reason(&exit(ProcessState::ExitedCrashed, Some(TerminationReason::Idle))),
            EndReason::Idle
        );
        assert_eq!(
            end_reason(&exit(ProcessState::ExitedClean, Some(TerminationReason::Shutdown))),
            EndReason::Shutdown
        );
        assert_eq!(
            end_reason(&exit(ProcessState::ExitedClean, Some(TerminationReason::ConnectionLost))),
            EndReason::Terminated
        );
    }
}
