//! Configuration for Tilehost.
//!
//! Everything the server needs to know before it accepts a single
//! connection lives here:
//!
//! - **Settings** ([`ServerConfig`]): the TOML file, validated once.
//! - **Games** ([`GameDefinition`], [`GameRegistry`]): which binaries can
//!   be launched and where each player's files go.
//! - **Usernames** ([`Username`], [`UsernamePolicy`]): the nick pattern
//!   plus a path-safety guard that no pattern can switch off.
//! - **Listeners** ([`ListenerEndpoint`]): the resolved address list.
//!
//! # How it fits in the stack
//!
//! ```text
//! tilehost (server, handler)       ← loads ServerConfig at startup
//!     ↓
//! session / process / transport    ← receive the slices they need
//!     ↓
//! Config Layer (this crate)        ← immutable after load
//! ```

mod error;
mod game;
mod listener;
mod settings;
mod username;

pub use error::{ConfigError, UsernameError};
pub use game::{substitute, GameDefinition, GameRegistry, ResolvedPaths, USERNAME_PLACEHOLDER};
pub use listener::{resolve_endpoints, ListenSettings, ListenerEndpoint, TlsSettings};
pub use settings::{
    AuthSettings, ConfigFile, CryptAlgorithm, LoggingSettings, ProcessSettings,
    ReconnectPolicy, RecordingSettings, ServerConfig, ServerSettings,
};
pub use username::{is_path_safe, Username, UsernamePolicy, DEFAULT_NICK_REGEX};
