//! Error types for the process supervisor.

use std::path::PathBuf;
use std::time::Duration;

/// Errors raised while starting or talking to a game process.
///
/// Every variant is scoped to one session. The handler reports a generic
/// failure to the player; the details go to the log.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// A per-user directory the game needs does not exist. The supervisor
    /// never creates these; the init-player program is expected to have
    /// run first.
    #[error("{what} directory {path} does not exist{}", hint_suffix(.hint))]
    MissingDirectory {
        what: &'static str,
        path: PathBuf,
        hint: Option<PathBuf>,
    },

    /// The socket path does not fit in `sockaddr_un`.
    #[error("socket path {path} is {len} bytes, limit is {max}")]
    SocketPathTooLong { path: PathBuf, len: usize, max: usize },

    /// The server-side socket could not be bound.
    #[error("cannot bind game socket {path}: {source}")]
    Socket {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The executable could not be started.
    #[error("cannot start {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The game did not connect to its socket in time.
    #[error("game did not connect within {0:?}")]
    ConnectTimeout(Duration),

    /// The game exited before connecting.
    #[error("game exited during startup ({0})")]
    ExitedDuringStartup(String),

    /// The process actor has stopped; the game is gone.
    #[error("game process for session {0} is no longer running")]
    Unavailable(String),
}

fn hint_suffix(hint: &Option<PathBuf>) -> String {
    match hint {
        Some(program) => format!(" (has {} run for this user?)", program.display()),
        None => String::new(),
    }
}
