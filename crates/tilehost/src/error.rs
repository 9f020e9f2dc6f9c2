//! Unified error type for the Tilehost server.

use tilehost_config::ConfigError;
use tilehost_process::ProcessError;
use tilehost_protocol::ProtocolError;
use tilehost_record::RecordError;
use tilehost_session::SessionError;
use tilehost_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// Only [`TilehostError::Config`] is fatal, and only at startup. The rest
/// end at most one connection.
#[derive(Debug, thiserror::Error)]
pub enum TilehostError {
    /// Bad configuration, missing TLS material, or a listener that could
    /// not be bound.
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Record(#[from] RecordError),

    /// A one-time startup operation (daemonize, pidfile, chroot, privilege
    /// drop) failed.
    #[error("startup: {0}")]
    Startup(String),
}

impl TilehostError {
    /// Whether the server must not start.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Startup(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err: TilehostError = TransportError::ConnectionClosed("gone".into()).into();
        assert!(matches!(err, TilehostError::Transport(_)));
        assert!(err.to_string().contains("gone"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_from_session_error() {
        let err: TilehostError = SessionError::CapacityExceeded { limit: 100 }.into();
        assert!(matches!(err, TilehostError::Session(_)));
        assert!(err.to_string().contains("100"));
    }

    #[test]
    fn test_from_config_error_is_fatal() {
        let err: TilehostError = ConfigError::NoGames.into();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_from_process_error() {
        let err: TilehostError = ProcessError::ExitedDuringStartup("exit 1".into()).into();
        assert!(matches!(err, TilehostError::Process(_)));
    }
}
