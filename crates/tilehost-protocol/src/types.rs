//! Messages exchanged with browser clients.
//!
//! Every message is a JSON object whose `msg` field names the variant:
//!
//! ```json
//! {"msg": "login", "username": "Alice", "password": "hunter22"}
//! {"msg": "game_started", "game_id": "dcss-trunk", "session_id": "9f0c…", …}
//! ```
//!
//! Game output is relayed as text. The game process writes raw bytes to
//! its socket; [`Utf8Carry`](crate::Utf8Carry) turns them into valid UTF-8
//! before they are wrapped in [`ServerMessage::Output`].

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Client → server
// ---------------------------------------------------------------------------

/// Requests a browser client may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Password login. With `remember`, the reply carries a login token
    /// the client can store and present with `token_login` later.
    Login {
        username: String,
        password: String,
        #[serde(default)]
        remember: bool,
    },

    /// Login with a previously issued token. The token is consumed and a
    /// fresh one is returned.
    TokenLogin { token: String },

    /// Creates an account and logs in.
    Register { username: String, password: String },

    /// Requires a logged-in connection.
    ChangePassword {
        current_password: String,
        new_password: String,
    },

    /// Forgets the stored login token (if given) and drops back to the
    /// anonymous state.
    Logout {
        #[serde(default)]
        token: Option<String>,
    },

    /// Starts, or resumes, a game.
    Play { game_id: String },

    /// Starts spectating another player's game.
    Watch { username: String },

    StopWatching,

    /// Keystrokes or a command line for the running game.
    Input { data: String },

    /// Leaves the current game without ending it.
    GoLobby,

    Heartbeat,

    ListGames,
}

// ---------------------------------------------------------------------------
// Server → client
// ---------------------------------------------------------------------------

/// One entry of the game list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameInfo {
    pub id: String,
    pub name: String,
}

/// One running game as shown in the lobby.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbyEntry {
    pub username: String,
    pub game_id: String,
    /// Seconds since the player last sent input.
    pub idle_secs: u64,
    pub spectators: usize,
    /// Whether a player connection is currently attached.
    pub attached: bool,
    /// Most recent milestone text, if any has been routed to this game.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milestone: Option<String>,
}

/// Why a game ended, as told to the player and spectators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The game exited normally.
    Exited,
    /// The game exited unexpectedly.
    Crashed,
    /// Ended for inactivity.
    Idle,
    /// The server is shutting down.
    Shutdown,
    /// Ended on request (connection loss under the terminate policy, or
    /// an administrative stop).
    Terminated,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Exited => "exited",
            Self::Crashed => "crashed",
            Self::Idle => "idle",
            Self::Shutdown => "shutdown",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum ServerMessage {
    LoginSuccess {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Every authentication failure looks like this, whatever the cause.
    LoginFail,

    /// Registration was refused. `reason` describes which policy failed;
    /// it never reveals anything about other accounts beyond "taken".
    RegisterFail { reason: String },

    PasswordChanged,

    LoggedOut,

    GameList { games: Vec<GameInfo> },

    Lobby { entries: Vec<LobbyEntry> },

    GameStarted {
        game_id: String,
        session_id: String,
        client_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        morgue_url: Option<String>,
        send_json_options: bool,
        /// `true` when an already-running game was re-attached.
        resumed: bool,
    },

    WatchingStarted { username: String, game_id: String },

    WatchingStopped,

    Output { data: String },

    GameEnded { reason: EndReason },

    HeartbeatAck,

    /// `code` follows HTTP conventions. `retryable` tells the client the
    /// same request may succeed later, e.g. when the server is full.
    Error {
        code: u16,
        message: String,
        retryable: bool,
    },
}

impl ServerMessage {
    /// Builds an [`Error`](Self::Error) message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.as_u16(),
            message: message.into(),
            retryable: code.is_retryable(),
        }
    }
}

/// Error codes carried by [`ServerMessage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Unparseable or out-of-place request.
    BadRequest,
    /// The request needs a logged-in connection.
    Unauthorized,
    /// Unknown game or player.
    NotFound,
    /// The player already has a game running elsewhere.
    Conflict,
    /// The game could not be started.
    Internal,
    /// The server is at capacity.
    Unavailable,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Internal => 500,
            Self::Unavailable => 503,
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_login_json_format() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"msg":"login","username":"Alice","password":"pw"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Login {
                username: "Alice".into(),
                password: "pw".into(),
                remember: false,
            }
        );
    }

    #[test]
    fn test_client_unit_variants_parse() {
        for (json, expected) in [
            (r#"{"msg":"go_lobby"}"#, ClientMessage::GoLobby),
            (r#"{"msg":"heartbeat"}"#, ClientMessage::Heartbeat),
            (r#"{"msg":"list_games"}"#, ClientMessage::ListGames),
            (r#"{"msg":"stop_watching"}"#, ClientMessage::StopWatching),
            (r#"{"msg":"logout"}"#, ClientMessage::Logout { token: None }),
        ] {
            let parsed: ClientMessage = serde_json::from_str(json).unwrap();
            assert_eq!(parsed, expected, "{json}");
        }
    }

    #[test]
    fn test_client_unknown_msg_rejected() {
        let result: Result<ClientMessage, _> =
            serde_json::from_str(r#"{"msg":"fly_to_moon"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_login_success_omits_absent_token() {
        let json = serde_json::to_value(ServerMessage::LoginSuccess {
            username: "Alice".into(),
            token: None,
        })
        .unwrap();
        assert_eq!(json["msg"], "login_success");
        assert!(json.get("token").is_none());
    }

    #[test]
    fn test_game_ended_reason_is_snake_case() {
        let json = serde_json::to_value(ServerMessage::GameEnded {
            reason: EndReason::Crashed,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"msg": "game_ended", "reason": "crashed"}));
    }

    #[test]
    fn test_capacity_error_is_retryable_503() {
        let json = serde_json::to_value(ServerMessage::error(
            ErrorCode::Unavailable,
            "server full",
        ))
        .unwrap();
        assert_eq!(json["msg"], "error");
        assert_eq!(json["code"], 503);
        assert_eq!(json["retryable"], true);

        let ServerMessage::Error { retryable, .. } =
            ServerMessage::error(ErrorCode::NotFound, "no such game")
        else {
            panic!("expected error message");
        };
        assert!(!retryable);
    }
}
