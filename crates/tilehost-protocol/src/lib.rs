//! Wire protocol for Tilehost.
//!
//! - **Types** ([`ClientMessage`], [`ServerMessage`]): JSON objects tagged
//!   by their `msg` field.
//! - **Codec** ([`Codec`], [`JsonCodec`]): bytes to messages and back.
//! - **UTF-8 carry** ([`Utf8Carry`]): turns raw game output into text
//!   without splitting characters.
//!
//! The protocol layer knows nothing about sockets, sessions or games. It
//! only knows the shapes of the messages.

mod codec;
mod error;
mod types;
mod utf8;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use types::{
    ClientMessage, EndReason, ErrorCode, GameInfo, LobbyEntry, ServerMessage,
};
pub use utf8::Utf8Carry;
