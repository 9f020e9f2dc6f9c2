//! # Tilehost
//!
//! Hosts terminal games for browser clients.
//!
//! Players connect over WebSocket (plain or TLS), log in, pick a game from
//! the lobby, and play it through a relay to a game process started just
//! for them. Others can watch. An idle monitor ends abandoned games and
//! closes silent connections.
//!
//! The layers, bottom up:
//!
//! | crate | role |
//! |-------|------|
//! | `tilehost-config` | TOML configuration, game definitions, username policy |
//! | `tilehost-protocol` | JSON messages exchanged with the browser |
//! | `tilehost-transport` | listeners, TLS, WebSocket upgrade |
//! | `tilehost-record` | ttyrec recording, milestone tailing |
//! | `tilehost-process` | game process supervisor |
//! | `tilehost-session` | sessions, registry, credentials |
//! | `tilehost-monitor` | idle and connection timeouts |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tilehost::prelude::*;
//!
//! # async fn run() -> Result<(), TilehostError> {
//! let config = ServerConfig::load(std::path::Path::new("tilehost.toml"))?;
//! let server = TilehostServer::builder(config).build().await?;
//! server.run().await
//! # }
//! ```

mod error;
mod handler;
pub mod logging;
pub mod privileges;
mod server;
pub mod signals;

pub use error::TilehostError;
pub use server::{supervisor_config, ShutdownHandle, TilehostServer, TilehostServerBuilder};

pub use tilehost_config as config;
pub use tilehost_monitor as monitor;
pub use tilehost_process as process;
pub use tilehost_protocol as protocol;
pub use tilehost_record as record;
pub use tilehost_session as session;
pub use tilehost_transport as transport;

pub mod prelude {
    pub use crate::{ShutdownHandle, TilehostError, TilehostServer, TilehostServerBuilder};
    pub use tilehost_config::ServerConfig;
    pub use tilehost_monitor::{MonitorConfig, MonitorEvent};
    pub use tilehost_process::SupervisorConfig;
    pub use tilehost_protocol::{ClientMessage, ServerMessage};
}
