//! Listener endpoint resolution.
//!
//! Each protocol (plain, TLS) is configured either with a single
//! address/port pair or with an explicit list of pairs. When the list is
//! present it replaces the single pair for that protocol entirely.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One address/port pair the server listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerEndpoint {
    /// Host or IP. Empty means all interfaces.
    pub address: String,
    pub port: u16,
    pub tls: bool,
}

impl ListenerEndpoint {
    pub fn plain(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            tls: false,
        }
    }

    pub fn tls(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            tls: true,
        }
    }

    /// The string handed to `TcpListener::bind`.
    ///
    /// An empty address binds every IPv4 interface; bare IPv6 literals
    /// are bracketed.
    pub fn bind_addr(&self) -> String {
        match self.address.as_str() {
            "" => format!("0.0.0.0:{}", self.port),
            a if a.contains(':') && !a.starts_with('[') => format!("[{a}]:{}", self.port),
            a => format!("{a}:{}", self.port),
        }
    }
}

impl fmt::Display for ListenerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "tls" } else { "plain" };
        write!(f, "{scheme}://{}", self.bind_addr())
    }
}

/// `[listen]` table: plaintext listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenSettings {
    /// Set to `false` to serve TLS only.
    pub bind_nonsecure: bool,
    pub bind_address: String,
    pub bind_port: u16,
    /// Overrides `bind_address`/`bind_port` when present.
    pub bind_pairs: Option<Vec<(String, u16)>>,
}

impl Default for ListenSettings {
    fn default() -> Self {
        Self {
            bind_nonsecure: true,
            bind_address: String::new(),
            bind_port: 8080,
            bind_pairs: None,
        }
    }
}

/// `[tls]` table. Its absence disables TLS without error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    pub certfile: PathBuf,
    pub keyfile: PathBuf,
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_tls_port")]
    pub port: u16,
    /// Overrides `address`/`port` when present.
    #[serde(default)]
    pub bind_pairs: Option<Vec<(String, u16)>>,
}

fn default_tls_port() -> u16 {
    8081
}

/// Expands the listen settings into the full endpoint list, plain first.
pub fn resolve_endpoints(
    listen: &ListenSettings,
    tls: Option<&TlsSettings>,
) -> Vec<ListenerEndpoint> {
    let mut endpoints = Vec::new();

    if listen.bind_nonsecure {
        match &listen.bind_pairs {
            Some(pairs) => endpoints.extend(
                pairs.iter().map(|(a, p)| ListenerEndpoint::plain(a.clone(), *p)),
            ),
            None => endpoints.push(ListenerEndpoint::plain(
                listen.bind_address.clone(),
                listen.bind_port,
            )),
        }
    }

    if let Some(tls) = tls {
        match &tls.bind_pairs {
            Some(pairs) => endpoints.extend(
                pairs.iter().map(|(a, p)| ListenerEndpoint::tls(a.clone(), *p)),
            ),
            None => endpoints.push(ListenerEndpoint::tls(tls.address.clone(), tls.port)),
        }
    }

    endpoints
}
