//! Error types for the configuration layer.
//!
//! Every variant of [`ConfigError`] is fatal: it is only produced while
//! the server starts, and the server refuses to run with a configuration
//! it cannot fully validate.

use std::path::PathBuf;

/// Errors raised while loading or validating the server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file (or a file it references) could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML document is malformed or has fields of the wrong type.
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Two `[[games]]` entries share the same identifier.
    #[error("duplicate game id `{0}`")]
    DuplicateGame(String),

    /// No `[[games]]` entries were configured.
    #[error("no games configured")]
    NoGames,

    /// A game field is unusable (empty id, missing placeholder, ...).
    #[error("game `{game}`: {reason}")]
    InvalidGame { game: String, reason: String },

    /// `nick_regex` does not compile.
    #[error("invalid nick_regex: {0}")]
    InvalidNickRegex(#[from] regex::Error),

    /// TLS was requested but the certificate or key file is missing.
    #[error("TLS requested but {kind} file {path} does not exist")]
    MissingTlsMaterial { kind: &'static str, path: PathBuf },

    /// The certificate or key file exists but cannot be used.
    #[error("invalid TLS {kind} in {path}: {reason}")]
    InvalidTlsMaterial {
        kind: &'static str,
        path: PathBuf,
        reason: String,
    },

    /// Plain listeners are disabled and no TLS listener is configured.
    #[error("no listeners configured (bind_nonsecure = false and no [tls] table)")]
    NoListeners,

    /// `crypt_salt_length` is outside what the chosen algorithm accepts.
    #[error("crypt_salt_length {length} is out of range for {algorithm} ({min}..={max})")]
    InvalidSaltLength {
        algorithm: &'static str,
        length: usize,
        min: usize,
        max: usize,
    },

    /// A numeric setting is zero where zero makes no sense.
    #[error("{0} must be greater than zero")]
    ZeroSetting(&'static str),

    /// A listener could not be bound. Surfaced by the transport layer at
    /// startup, classified here because it is a configuration problem.
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised when a raw username fails the username policy.
///
/// These are per-request and never fatal to the server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UsernameError {
    /// The name does not match the configured nick pattern.
    #[error("username does not match the nick pattern")]
    Pattern,

    /// The name contains a path separator, a parent-directory sequence,
    /// or another character that could escape a per-user directory.
    #[error("username is not safe to use in a path")]
    UnsafePath,
}
