//! Error types for the session layer.

use std::path::PathBuf;

use tilehost_config::UsernameError;

/// Errors that can occur in session admission and authentication.
///
/// All of them are per-request. None of them is fatal to the server.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The server already holds as many live sessions as it may.
    /// Retryable: a slot frees up as soon as any game ends.
    #[error("server is full ({limit} sessions)")]
    CapacityExceeded { limit: usize },

    /// No session with this id.
    #[error("session {0} not found")]
    NotFound(String),

    /// The player already has a game attached to another connection, or
    /// running a different game.
    #[error("{0} is already playing")]
    AlreadyPlaying(String),

    /// Wrong username or password. Deliberately says nothing more.
    #[error("authentication failed")]
    AuthFailed,

    /// The login token is past its expiry.
    #[error("login token expired")]
    ExpiredToken,

    /// The login token is unknown, revoked, or belongs to a password
    /// that has since changed.
    #[error("invalid login token")]
    InvalidToken,

    /// Registration for a name that is taken.
    #[error("user {0} already exists")]
    UserExists(String),

    #[error(transparent)]
    InvalidUsername(#[from] UsernameError),

    /// The password is empty or longer than the configured maximum.
    /// Over-long passwords are rejected, never truncated.
    #[error("password must be 1 to {max} characters")]
    InvalidPassword { max: usize },

    /// The hashing backend refused the input.
    #[error("password hashing failed: {0}")]
    Hashing(String),

    /// The password database could not be read or written.
    #[error("password database {path}: {reason}")]
    Storage { path: PathBuf, reason: String },
}
