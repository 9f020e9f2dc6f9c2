//! The top-level [`ServerConfig`] and its TOML tables.
//!
//! The file is parsed into a raw [`ConfigFile`], then validated into a
//! `ServerConfig`. Validation is where every startup-fatal check lives:
//! duplicate games, a bad nick pattern, missing TLS material, an empty
//! listener set, salt lengths the hash algorithm cannot use.
//!
//! After validation the config is immutable. The server wraps it in an
//! `Arc` and hands each component the part it needs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::listener::{resolve_endpoints, ListenSettings, ListenerEndpoint, TlsSettings};
use crate::{ConfigError, GameDefinition, GameRegistry, UsernamePolicy, DEFAULT_NICK_REGEX};

// ---------------------------------------------------------------------------
// Enumerated settings
// ---------------------------------------------------------------------------

/// Password hashing algorithm for new credential records.
///
/// Existing records keep the algorithm they were created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CryptAlgorithm {
    /// Argon2id with a random salt.
    #[default]
    Argon2,
    /// crypt(3) `$6$`.
    #[serde(alias = "6")]
    Sha512,
    /// crypt(3) `$5$`.
    #[serde(alias = "5")]
    Sha256,
    /// crypt(3) `$1$`.
    #[serde(alias = "1")]
    Md5,
    /// Traditional DES crypt with a random two-character salt. Only the
    /// first eight password characters are significant.
    Des,
    /// Traditional DES crypt using the password itself as the salt.
    ///
    /// Exists only to read password databases inherited from
    /// dgamelaunch. The stored hash begins with the first two characters
    /// of the plaintext password. Never the default.
    Broken,
}

impl CryptAlgorithm {
    /// The tag stored next to each credential record.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Argon2 => "argon2",
            Self::Sha512 => "sha512",
            Self::Sha256 => "sha256",
            Self::Md5 => "md5",
            Self::Des => "des",
            Self::Broken => "broken",
        }
    }

    /// Inverse of [`tag`](Self::tag).
    pub fn from_tag(tag: &str) -> Option<Self> {
        [
            Self::Argon2,
            Self::Sha512,
            Self::Sha256,
            Self::Md5,
            Self::Des,
            Self::Broken,
        ]
        .into_iter()
        .find(|a| a.tag() == tag)
    }

    /// Accepted `crypt_salt_length` range, or `None` when the salt length
    /// is fixed by the algorithm and the setting is ignored.
    pub fn salt_length_range(self) -> Option<(usize, usize)> {
        match self {
            Self::Argon2 => Some((12, 64)),
            Self::Sha512 | Self::Sha256 => Some((1, 16)),
            Self::Md5 => Some((1, 8)),
            Self::Des | Self::Broken => None,
        }
    }
}

/// What happens to a game process when its player's connection drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconnectPolicy {
    /// The process keeps running headless. The player can resume it by
    /// playing the same game again; the idle timeout reaps it otherwise.
    #[default]
    KeepDetached,
    /// The process is terminated gracefully as soon as the connection
    /// is lost.
    Terminate,
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// `[server]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Name written into recordings and the lobby.
    pub server_id: String,
    /// Ceiling on concurrently live sessions.
    pub max_connections: usize,
    /// Seconds without any traffic before a connection is closed.
    pub connection_timeout: u64,
    /// Seconds without player input before a game is ended gracefully.
    pub max_idle_time: u64,
    /// Seconds a game has to exit after the hangup signal.
    pub kill_timeout: u64,
    /// Seconds between idle monitor sweeps.
    pub monitor_interval: u64,
    /// Seconds a new game has to connect to its socket.
    pub spawn_timeout: u64,
    /// Directory for server-side game sockets. Defaults to the game's
    /// resolved `socket_path`.
    pub server_socket_path: Option<PathBuf>,
    /// Script that prepares a user's directories. Run out of band; only
    /// mentioned in spawn failure diagnostics.
    pub init_player_program: Option<PathBuf>,
    pub reconnect_policy: ReconnectPolicy,
    /// Consecutive failed logins after which a connection is closed.
    pub max_login_failures: u32,
    /// File rewritten with one line per running game, for external
    /// tools. Not written when unset.
    pub status_file: Option<PathBuf>,
    /// Seconds between rewrites of `status_file`.
    pub status_file_update_rate: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            server_id: "tilehost".to_string(),
            max_connections: 100,
            connection_timeout: 600,
            max_idle_time: 5 * 60 * 60,
            kill_timeout: 10,
            monitor_interval: 5,
            spawn_timeout: 10,
            server_socket_path: None,
            init_player_program: None,
            reconnect_policy: ReconnectPolicy::default(),
            max_login_failures: 5,
            status_file: None,
            status_file_update_rate: 5,
        }
    }
}

impl ServerSettings {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    pub fn max_idle_time(&self) -> Duration {
        Duration::from_secs(self.max_idle_time)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval)
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.spawn_timeout)
    }

    pub fn status_file_update_rate(&self) -> Duration {
        Duration::from_secs(self.status_file_update_rate)
    }
}

/// `[auth]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub password_db: PathBuf,
    pub crypt_algorithm: CryptAlgorithm,
    pub crypt_salt_length: usize,
    /// Login token lifetime in days.
    pub login_token_lifetime: u32,
    pub nick_regex: String,
    pub max_passwd_length: usize,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            password_db: PathBuf::from("./passwd.json"),
            crypt_algorithm: CryptAlgorithm::default(),
            crypt_salt_length: 16,
            login_token_lifetime: 7,
            nick_regex: DEFAULT_NICK_REGEX.to_string(),
            max_passwd_length: 20,
        }
    }
}

/// `[recording]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingSettings {
    /// Shared milestone file. `None` disables ingestion.
    pub milestone_file: Option<PathBuf>,
    /// Terminal size written at the start of every ttyrec, `(cols, rows)`.
    pub term_size: (u16, u16),
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            milestone_file: None,
            term_size: (80, 24),
        }
    }
}

/// `[logging]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter directive (trace, debug, info, warn, error, or an
    /// `EnvFilter` expression).
    pub level: String,
    pub json_format: bool,
    /// Log file. `None` logs to stdout.
    pub file_path: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            file_path: None,
        }
    }
}

/// `[process]` table: one-time startup operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSettings {
    /// Numeric uid to switch to after the listeners are bound.
    pub uid: Option<u32>,
    /// Numeric gid to switch to after the listeners are bound.
    pub gid: Option<u32>,
    pub umask: Option<u32>,
    pub chroot: Option<PathBuf>,
    pub pidfile: Option<PathBuf>,
    /// Detach from the controlling terminal before starting.
    pub daemon: bool,
}

/// The raw TOML document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub server: ServerSettings,
    pub listen: ListenSettings,
    pub tls: Option<TlsSettings>,
    pub auth: AuthSettings,
    pub recording: RecordingSettings,
    pub logging: LoggingSettings,
    pub process: ProcessSettings,
    pub games: Vec<GameDefinition>,
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

/// Validated, immutable server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server: ServerSettings,
    pub listen: ListenSettings,
    pub tls: Option<TlsSettings>,
    pub auth: AuthSettings,
    pub recording: RecordingSettings,
    pub logging: LoggingSettings,
    pub process: ProcessSettings,
    games: GameRegistry,
    nick_policy: UsernamePolicy,
    endpoints: Vec<ListenerEndpoint>,
}

impl ServerConfig {
    /// Reads and validates a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        info!(
            path = %path.display(),
            games = config.games.len(),
            listeners = config.endpoints.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        Self::from_file(file)
    }

    /// Validates an already-parsed document.
    pub fn from_file(file: ConfigFile) -> Result<Self, ConfigError> {
        if file.games.is_empty() {
            return Err(ConfigError::NoGames);
        }
        let games = GameRegistry::new(file.games)?;
        let nick_policy = UsernamePolicy::new(&file.auth.nick_regex)?;

        for (name, value) in [
            ("max_connections", file.server.max_connections as u64),
            ("kill_timeout", file.server.kill_timeout),
            ("monitor_interval", file.server.monitor_interval),
            ("max_idle_time", file.server.max_idle_time),
            ("connection_timeout", file.server.connection_timeout),
            ("spawn_timeout", file.server.spawn_timeout),
            ("status_file_update_rate", file.server.status_file_update_rate),
            ("max_passwd_length", file.auth.max_passwd_length as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroSetting(name));
            }
        }

        let algorithm = file.auth.crypt_algorithm;
        if let Some((min, max)) = algorithm.salt_length_range() {
            let length = file.auth.crypt_salt_length;
            if !(min..=max).contains(&length) {
                return Err(ConfigError::InvalidSaltLength {
                    algorithm: algorithm.tag(),
                    length,
                    min,
                    max,
                });
            }
        }
        if algorithm == CryptAlgorithm::Broken {
            warn!(
                "crypt_algorithm = \"broken\": new password hashes will reveal the \
                 first two characters of each password"
            );
        }

        if let Some(tls) = &file.tls {
            for (kind, path) in [("certificate", &tls.certfile), ("key", &tls.keyfile)] {
                if !path.is_file() {
                    return Err(ConfigError::MissingTlsMaterial {
                        kind,
                        path: path.clone(),
                    });
                }
            }
        }

        let endpoints = resolve_endpoints(&file.listen, file.tls.as_ref());
        if endpoints.is_empty() {
            return Err(ConfigError::NoListeners);
        }

        Ok(Self {
            server: file.server,
            listen: file.listen,
            tls: file.tls,
            auth: file.auth,
            recording: file.recording,
            logging: file.logging,
            process: file.process,
            games,
            nick_policy,
            endpoints,
        })
    }

    /// Games in display order.
    pub fn games(&self) -> &GameRegistry {
        &self.games
    }

    /// The compiled username policy.
    pub fn nick_policy(&self) -> &UsernamePolicy {
        &self.nick_policy
    }

    /// Every endpoint the server must bind, plain first.
    pub fn endpoints(&self) -> &[ListenerEndpoint] {
        &self.endpoints
    }

    /// Login token lifetime.
    pub fn token_lifetime(&self) -> Duration {
        Duration::from_secs(u64::from(self.auth.login_token_lifetime) * 24 * 60 * 60)
    }
}
