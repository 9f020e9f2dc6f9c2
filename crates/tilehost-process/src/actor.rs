//! Process actor: one Tokio task per game process.
//!
//! The actor owns the child, the read half of its socket, and the
//! recording. Everything else talks to it through a [`ProcessHandle`].
//! Because the actor is the only place a termination sequence can run,
//! concurrent terminate calls coalesce naturally: the first one starts
//! the sequence, later ones just wait for its outcome.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use tilehost_record::TtyrecWriter;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::process::Child;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::launch::remove_if_present;
use crate::{
    ProcessError, ProcessExit, ProcessInfo, ProcessState, TerminationOutcome,
    TerminationReason, ViewerEvent, ViewerId, ViewerRole, ViewerSender,
};

const READ_BUFFER: usize = 16 * 1024;

/// A game exiting this long after closing its socket unasked did not
/// close it as part of exiting.
const SOCKET_EXIT_GRACE: Duration = Duration::from_millis(500);

/// Commands sent to a process actor through its channel.
pub(crate) enum ProcessCommand {
    Attach {
        viewer: ViewerId,
        role: ViewerRole,
        sender: ViewerSender,
        reply: oneshot::Sender<()>,
    },
    Detach {
        viewer: ViewerId,
    },
    Input {
        data: Vec<u8>,
    },
    Terminate {
        graceful: bool,
        reason: TerminationReason,
        reply: oneshot::Sender<TerminationOutcome>,
    },
    GetInfo {
        reply: oneshot::Sender<ProcessInfo>,
    },
}

/// Handle to a running game process.
///
/// Cheap to clone. The registry keeps one in the session; the handler and
/// monitor clone it as needed. When every handle is gone the actor ends
/// the game gracefully on its own.
#[derive(Clone)]
pub struct ProcessHandle {
    session_id: Arc<str>,
    pid: Option<u32>,
    socket_path: Arc<PathBuf>,
    sender: mpsc::Sender<ProcessCommand>,
    state: watch::Receiver<ProcessState>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("session_id", &self.session_id)
            .field("pid", &self.pid)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl ProcessHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The socket the game was told to connect to.
    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    /// Current lifecycle state. Never blocks.
    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// A receiver that sees every state transition.
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.clone()
    }

    /// Resolves once the process has exited.
    pub async fn wait_exit(&self) -> ProcessState {
        let mut rx = self.state.clone();
        let waited = rx.wait_for(|s| !s.is_running()).await.map(|state| *state);
        match waited {
            Ok(state) => state,
            // The actor is gone, so the process is too.
            Err(_) => *rx.borrow(),
        }
    }

    fn unavailable(&self) -> ProcessError {
        ProcessError::Unavailable(self.session_id.to_string())
    }

    /// Starts forwarding output to `sender`.
    ///
    /// Attaching a second [`ViewerRole::Player`] replaces the first.
    pub async fn attach(
        &self,
        viewer: ViewerId,
        role: ViewerRole,
        sender: ViewerSender,
    ) -> Result<(), ProcessError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(ProcessCommand::Attach {
                viewer,
                role,
                sender,
                reply: reply_tx,
            })
            .await
            .map_err(|_| self.unavailable())?;
        reply_rx.await.map_err(|_| self.unavailable())
    }

    /// Stops forwarding output to `viewer`. Fire-and-forget.
    pub async fn detach(&self, viewer: ViewerId) {
        let _ = self.sender.send(ProcessCommand::Detach { viewer }).await;
    }

    /// Writes input to the game's socket. Fire-and-forget.
    pub async fn send_input(&self, data: Vec<u8>) -> Result<(), ProcessError> {
        self.sender
            .send(ProcessCommand::Input { data })
            .await
            .map_err(|_| self.unavailable())
    }

    /// Ends the process and waits for the outcome.
    ///
    /// Graceful sends a hangup and waits up to the kill timeout before
    /// killing. Calls made while a sequence is already in flight join it;
    /// a forced call escalates it immediately.
    pub async fn terminate(&self, graceful: bool, reason: TerminationReason) -> TerminationOutcome {
        if !self.state().is_running() {
            return TerminationOutcome::AlreadyExited;
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self
            .sender
            .send(ProcessCommand::Terminate {
                graceful,
                reason,
                reply: reply_tx,
            })
            .await;
        if sent.is_err() {
            return TerminationOutcome::AlreadyExited;
        }
        reply_rx.await.unwrap_or(TerminationOutcome::AlreadyExited)
    }

    /// Requests a metadata snapshot.
    pub async fn info(&self) -> Result<ProcessInfo, ProcessError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(ProcessCommand::GetInfo { reply: reply_tx })
            .await
            .map_err(|_| self.unavailable())?;
        reply_rx.await.map_err(|_| self.unavailable())
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// An in-flight termination sequence.
struct Termination {
    reason: Option<TerminationReason>,
    /// `true` once the kill has been sent.
    forced: bool,
    /// When to escalate to a kill. `None` after escalation.
    deadline: Option<Instant>,
    waiters: Vec<oneshot::Sender<TerminationOutcome>>,
}

pub(crate) struct ActorParts {
    pub session_id: Arc<str>,
    pub username: String,
    pub child: Child,
    pub reader: OwnedReadHalf,
    pub writer: OwnedWriteHalf,
    pub recorder: Option<TtyrecWriter>,
    pub inprogress: PathBuf,
    pub socket_path: PathBuf,
    pub kill_timeout: Duration,
    pub channel_size: usize,
    pub input_buffer: usize,
}

struct ProcessActor {
    session_id: Arc<str>,
    username: String,
    pid: Option<u32>,
    kill_timeout: Duration,
    player: Option<(ViewerId, ViewerSender)>,
    spectators: HashMap<ViewerId, ViewerSender>,
    recorder: Option<TtyrecWriter>,
    input: mpsc::Sender<Vec<u8>>,
    dropped_input: u64,
    termination: Option<Termination>,
    socket_open: bool,
    /// When the game closed its socket without being asked to stop.
    socket_closed_unasked: Option<Instant>,
    inprogress: PathBuf,
    state: watch::Sender<ProcessState>,
    receiver: mpsc::Receiver<ProcessCommand>,
}

/// Starts the actor and returns its handle.
pub(crate) fn spawn_actor(parts: ActorParts) -> ProcessHandle {
    let (tx, rx) = mpsc::channel(parts.channel_size);
    let (state_tx, state_rx) = watch::channel(ProcessState::Running);
    let (input_tx, input_rx) = mpsc::channel(parts.input_buffer.max(1));
    let pid = parts.child.id();

    tokio::spawn(input_pump(parts.writer, input_rx, parts.session_id.clone()));

    let actor = ProcessActor {
        session_id: parts.session_id.clone(),
        username: parts.username,
        pid,
        kill_timeout: parts.kill_timeout,
        player: None,
        spectators: HashMap::new(),
        recorder: parts.recorder,
        input: input_tx,
        dropped_input: 0,
        termination: None,
        socket_open: true,
        socket_closed_unasked: None,
        inprogress: parts.inprogress,
        state: state_tx,
        receiver: rx,
    };
    tokio::spawn(actor.run(parts.child, parts.reader));

    ProcessHandle {
        session_id: parts.session_id,
        pid,
        socket_path: Arc::new(parts.socket_path),
        sender: tx,
        state: state_rx,
    }
}

/// Writes queued input to the game. Runs apart from the actor so a game
/// that stops reading cannot stall output or termination.
async fn input_pump(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Vec<u8>>,
    session_id: Arc<str>,
) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            debug!(%session_id, error = %e, "game socket write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Sleeps until `deadline`, or forever when there is none.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl ProcessActor {
    async fn run(mut self, mut child: Child, mut reader: OwnedReadHalf) {
        info!(session_id = %self.session_id, username = %self.username, pid = ?self.pid, "game process started");

        let mut buf = vec![0u8; READ_BUFFER];
        let mut commands_open = true;

        let status = loop {
            let deadline = self.termination.as_ref().and_then(|t| t.deadline);
            tokio::select! {
                cmd = self.receiver.recv(), if commands_open => match cmd {
                    Some(cmd) => self.handle_command(cmd, &mut child),
                    None => {
                        // Every handle dropped: nobody can reach this game again.
                        commands_open = false;
                        self.begin_termination(true, Some(TerminationReason::Requested), None, &mut child);
                    }
                },
                read = reader.read(&mut buf), if self.socket_open => match read {
                    Ok(0) | Err(_) => self.on_socket_closed(),
                    Ok(n) => self.on_output(&buf[..n]).await,
                },
                status = child.wait() => break status,
                _ = sleep_until_opt(deadline) => self.escalate(&mut child),
            }
        };

        let code = status.as_ref().ok().and_then(|s| s.code());
        let success = status.as_ref().map(|s| s.success()).unwrap_or(false);
        let requested = self.termination.as_ref().and_then(|t| t.reason);
        let abandoned = self
            .socket_closed_unasked
            .is_some_and(|at| at.elapsed() > SOCKET_EXIT_GRACE);
        let state = if requested.is_some() || (success && !abandoned) {
            ProcessState::ExitedClean
        } else {
            ProcessState::ExitedCrashed
        };

        match state {
            ProcessState::ExitedCrashed => warn!(
                session_id = %self.session_id,
                username = %self.username,
                status = ?status,
                "game process exited unexpectedly"
            ),
            _ => info!(
                session_id = %self.session_id,
                username = %self.username,
                code = ?code,
                reason = ?requested,
                "game process exited"
            ),
        }

        self.finish(ProcessExit {
            state,
            reason: requested,
            code,
        })
        .await;
    }

    fn handle_command(&mut self, cmd: ProcessCommand, child: &mut Child) {
        match cmd {
            ProcessCommand::Attach {
                viewer,
                role,
                sender,
                reply,
            } => {
                match role {
                    ViewerRole::Player => {
                        if let Some((old, _)) = self.player.replace((viewer, sender)) {
                            if old != viewer {
                                debug!(session_id = %self.session_id, %old, %viewer, "player connection replaced");
                            }
                        }
                    }
                    ViewerRole::Spectator => {
                        self.spectators.insert(viewer, sender);
                    }
                }
                debug!(session_id = %self.session_id, %viewer, ?role, "viewer attached");
                let _ = reply.send(());
            }
            ProcessCommand::Detach { viewer } => {
                if self.player.as_ref().is_some_and(|(id, _)| *id == viewer) {
                    self.player = None;
                }
                self.spectators.remove(&viewer);
                debug!(session_id = %self.session_id, %viewer, "viewer detached");
            }
            ProcessCommand::Input { data } => {
                if self.termination.is_none() {
                    self.queue_input(data);
                }
            }
            ProcessCommand::Terminate {
                graceful,
                reason,
                reply,
            } => self.begin_termination(graceful, Some(reason), Some(reply), child),
            ProcessCommand::GetInfo { reply } => {
                let _ = reply.send(self.info());
            }
        }
    }

    fn begin_termination(
        &mut self,
        graceful: bool,
        reason: Option<TerminationReason>,
        reply: Option<oneshot::Sender<TerminationOutcome>>,
        child: &mut Child,
    ) {
        match &mut self.termination {
            Some(existing) => {
                if existing.reason.is_none() {
                    existing.reason = reason;
                }
                existing.waiters.extend(reply);
                if !graceful && !existing.forced {
                    self.escalate(child);
                }
                return;
            }
            None => {
                self.termination = Some(Termination {
                    reason,
                    forced: false,
                    deadline: None,
                    waiters: reply.into_iter().collect(),
                });
            }
        }

        if !graceful {
            self.escalate(child);
            return;
        }

        info!(
            session_id = %self.session_id,
            pid = ?self.pid,
            reason = ?reason,
            kill_timeout = ?self.kill_timeout,
            "sending hangup to game process"
        );
        if let Some(pid) = self.pid {
            // SAFETY: plain kill(2) on our own child's pid; the child is
            // not reaped until `wait` returns, so the pid cannot be reused.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGHUP) };
            if rc != 0 {
                debug!(session_id = %self.session_id, error = %std::io::Error::last_os_error(), "hangup failed");
            }
        }
        if let Some(t) = &mut self.termination {
            t.deadline = Some(Instant::now() + self.kill_timeout);
        }
    }

    /// Kills the child. Used when the grace period runs out, or when a
    /// forced stop is requested.
    fn escalate(&mut self, child: &mut Child) {
        let termination = self.termination.get_or_insert_with(|| Termination {
            reason: None,
            forced: false,
            deadline: None,
            waiters: Vec::new(),
        });
        if termination.forced {
            return;
        }
        termination.forced = true;
        termination.deadline = None;
        warn!(
            session_id = %self.session_id,
            username = %self.username,
            pid = ?self.pid,
            reason = ?termination.reason,
            "forced termination of game process"
        );
        if let Err(e) = child.start_kill() {
            debug!(session_id = %self.session_id, error = %e, "kill failed");
        }
    }

    /// The game closed its socket. It has `kill_timeout` to exit on its
    /// own before it is killed.
    fn on_socket_closed(&mut self) {
        self.socket_open = false;
        debug!(session_id = %self.session_id, "game socket closed");
        if self.termination.is_none() {
            self.socket_closed_unasked = Some(Instant::now());
            self.termination = Some(Termination {
                reason: None,
                forced: false,
                deadline: Some(Instant::now() + self.kill_timeout),
                waiters: Vec::new(),
            });
        }
    }

    async fn on_output(&mut self, data: &[u8]) {
        if let Some(recorder) = &mut self.recorder {
            if let Err(e) = recorder.record(data, SystemTime::now()).await {
                warn!(session_id = %self.session_id, error = %e, "recording failed; continuing without it");
                self.recorder = None;
            }
        }

        let chunk: Arc<[u8]> = Arc::from(data);
        let session_id = &self.session_id;
        if let Some((viewer, sender)) = &self.player {
            if !deliver(session_id, *viewer, sender, ViewerEvent::Output(chunk.clone())) {
                self.player = None;
            }
        }
        self.spectators
            .retain(|viewer, sender| deliver(session_id, *viewer, sender, ViewerEvent::Output(chunk.clone())));
    }

    /// Queues input for the writer task. Input that finds the queue full
    /// is refused: the game has stopped reading.
    fn queue_input(&mut self, data: Vec<u8>) {
        match self.input.try_send(data) {
            Ok(()) => {}
            Err(TrySendError::Full(data)) => {
                self.dropped_input += 1;
                warn!(
                    session_id = %self.session_id,
                    bytes = data.len(),
                    dropped = self.dropped_input,
                    "game is not reading input; input refused"
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session_id = %self.session_id, "game socket writer gone; input dropped");
            }
        }
    }

    fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            state: *self.state.borrow(),
            player_attached: self.player.is_some(),
            spectators: self.spectators.len(),
            terminating: self.termination.is_some(),
            recording: self.recorder.is_some(),
            dropped_input: self.dropped_input,
        }
    }

    /// Publishes the exit and releases everything the process held.
    async fn finish(mut self, exit: ProcessExit) {
        let _ = self.state.send(exit.state);

        if let Some(termination) = self.termination.take() {
            let outcome = if termination.forced {
                TerminationOutcome::Forced
            } else {
                TerminationOutcome::Graceful
            };
            for waiter in termination.waiters {
                let _ = waiter.send(outcome);
            }
        }

        if let Some((_, sender)) = self.player.take() {
            send_final(sender, exit);
        }
        for (_, sender) in self.spectators.drain() {
            send_final(sender, exit);
        }

        if let Some(recorder) = self.recorder.take() {
            if let Err(e) = recorder.finish().await {
                warn!(session_id = %self.session_id, error = %e, "cannot finish recording");
            }
        }
        remove_if_present(&self.inprogress).await;

        // Anyone still holding a handle gets `AlreadyExited` from here on.
        self.receiver.close();
        while let Ok(cmd) = self.receiver.try_recv() {
            match cmd {
                ProcessCommand::Terminate { reply, .. } => {
                    let _ = reply.send(TerminationOutcome::AlreadyExited);
                }
                ProcessCommand::GetInfo { reply } => {
                    let _ = reply.send(self.info());
                }
                ProcessCommand::Attach { sender, reply, .. } => {
                    send_final(sender, exit);
                    let _ = reply.send(());
                }
                ProcessCommand::Detach { .. } | ProcessCommand::Input { .. } => {}
            }
        }
        debug!(session_id = %self.session_id, "process actor stopped");
    }
}

/// Hands one output event to a viewer. Returns `false` when the viewer
/// must be detached: it went away, or its queue is full.
fn deliver(session_id: &str, viewer: ViewerId, sender: &ViewerSender, event: ViewerEvent) -> bool {
    match sender.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(%session_id, %viewer, "viewer fell behind game output; detaching it");
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(%session_id, %viewer, "viewer channel closed");
            false
        }
    }
}

/// Delivers the final event. A full queue gets it once the viewer has
/// caught up; a viewer that went away never does.
fn send_final(sender: ViewerSender, exit: ProcessExit) {
    if let Err(TrySendError::Full(event)) = sender.try_send(ViewerEvent::Ended(exit)) {
        tokio::spawn(async move {
            let _ = sender.send(event).await;
        });
    }
}
