//! Supervisor configuration and the observable process lifecycle.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// SupervisorConfig
// ---------------------------------------------------------------------------

/// Settings shared by every game process.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Grace period between the hangup signal and the kill.
    pub kill_timeout: Duration,
    /// How long a new game has to connect to its socket.
    pub connect_timeout: Duration,
    /// Directory for game sockets. `None` uses the game's own socket
    /// directory.
    pub server_socket_path: Option<PathBuf>,
    /// Terminal size written at the start of each recording.
    pub term_size: (u16, u16),
    /// Named in diagnostics when a user's directories are missing.
    pub init_player_program: Option<PathBuf>,
    /// Capacity of each process actor's command channel.
    pub channel_size: usize,
    /// Output chunks queued per viewer before that viewer is dropped.
    pub viewer_buffer: usize,
    /// Input writes queued for a game before further input is refused.
    pub input_buffer: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            kill_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            server_socket_path: None,
            term_size: (80, 24),
            init_player_program: None,
            channel_size: 64,
            viewer_buffer: 256,
            input_buffer: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessState
// ---------------------------------------------------------------------------

/// The three observable states of a game process.
///
/// ```text
/// Running ──exit (success, or termination was requested)──▶ ExitedClean
///    │
///    └────exit (anything else)──────────────────────────────▶ ExitedCrashed
/// ```
///
/// Transitions are driven by the process-exit notification. Socket
/// closure starts the clock on an exit but does not count as one; a game
/// that closes its socket unasked and only exits later has crashed,
/// whatever its exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    Running,
    ExitedClean,
    ExitedCrashed,
}

impl ProcessState {
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::ExitedClean => write!(f, "exited-clean"),
            Self::ExitedCrashed => write!(f, "exited-crashed"),
        }
    }
}

/// Why a termination was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationReason {
    /// The player stopped sending input for too long.
    Idle,
    /// The player's connection went away and the policy says to end the
    /// game.
    ConnectionLost,
    /// The server is shutting down.
    Shutdown,
    /// Anything else, e.g. an explicit stop.
    Requested,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::ConnectionLost => write!(f, "connection-lost"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::Requested => write!(f, "requested"),
        }
    }
}

/// How a termination sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationOutcome {
    /// The process exited within the kill timeout after the hangup.
    Graceful,
    /// The kill timeout expired, or a forced stop was asked for, and the
    /// process was killed.
    Forced,
    /// Nothing to do: the process had already exited.
    AlreadyExited,
}

/// Final word on a process, delivered to every viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub state: ProcessState,
    /// Set when the exit followed a termination request.
    pub reason: Option<TerminationReason>,
    /// Exit code, if the process exited rather than being signalled.
    pub code: Option<i32>,
}

// ---------------------------------------------------------------------------
// Viewers
// ---------------------------------------------------------------------------

/// Identifies one attached viewer, normally the connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewerId(pub u64);

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "viewer-{}", self.0)
    }
}

/// What a viewer may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewerRole {
    /// The owner. At most one at a time; input is only accepted from
    /// the player's connection.
    Player,
    /// Read-only watcher.
    Spectator,
}

/// Events pushed to attached viewers.
#[derive(Debug, Clone)]
pub enum ViewerEvent {
    /// Raw bytes written by the game.
    Output(Arc<[u8]>),
    /// The process is gone. Always the last event.
    Ended(ProcessExit),
}

/// Channel sender delivering events to one viewer. Bounded: a viewer
/// whose queue is full when output arrives is detached.
pub type ViewerSender = mpsc::Sender<ViewerEvent>;

/// A snapshot of process metadata.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: Option<u32>,
    pub state: ProcessState,
    pub player_attached: bool,
    pub spectators: usize,
    /// Whether a termination sequence is in flight.
    pub terminating: bool,
    pub recording: bool,
    /// Input writes refused because the game stopped reading.
    pub dropped_input: u64,
}
