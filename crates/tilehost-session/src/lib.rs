//! Sessions and accounts for Tilehost.
//!
//! This crate decides who may play and keeps track of who is playing:
//!
//! 1. **Accounts** ([`CredentialStore`]): registration, password checks,
//!    and rotating login tokens, backed by a JSON password database.
//! 2. **Sessions** ([`SessionRegistry`]): one game per player, a hard cap
//!    on concurrent sessions, and resumption of detached games.
//!
//! # How it fits in the stack
//!
//! ```text
//! tilehost (connection handler)  ← admits players, attaches connections
//!     ↕
//! Session Layer (this crate)     ← identity, admission, attachment state
//!     ↕
//! tilehost-process               ← the game behind each session
//! ```

mod credentials;
mod error;
mod hash;
mod registry;
mod session;

pub use credentials::{CredentialStore, LoginToken};
pub use error::SessionError;
pub use hash::{strategy_for, Argon2Strategy, BrokenStrategy, CryptStrategy, HashStrategy};
pub use registry::{Admission, SessionRegistry};
pub use session::{Attachment, Session, SessionId, SessionSnapshot};
