//! TLS material loading.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tilehost_config::{ConfigError, TlsSettings};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

/// Builds a TLS acceptor from the PEM certificate chain and private key
/// named in `[tls]`.
///
/// # Errors
/// [`ConfigError::MissingTlsMaterial`] if a file is absent,
/// [`ConfigError::InvalidTlsMaterial`] if it holds nothing usable.
pub fn load_acceptor(settings: &TlsSettings) -> Result<TlsAcceptor, ConfigError> {
    let certs = load_certs(&settings.certfile)?;
    let key = load_key(&settings.keyfile)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ConfigError::InvalidTlsMaterial {
            kind: "key",
            path: settings.keyfile.clone(),
            reason: e.to_string(),
        })?;

    tracing::debug!(certfile = %settings.certfile.display(), "TLS material loaded");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn open(kind: &'static str, path: &Path) -> Result<BufReader<File>, ConfigError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|_| ConfigError::MissingTlsMaterial {
            kind,
            path: path.to_path_buf(),
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidTlsMaterial {
        kind: "certificate",
        path: path.to_path_buf(),
        reason,
    };
    let mut reader = open("certificate", path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| invalid(e.to_string()))?;
    if certs.is_empty() {
        return Err(invalid("no certificates found".to_string()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidTlsMaterial {
        kind: "key",
        path: path.to_path_buf(),
        reason,
    };
    let mut reader = open("key", path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| invalid(e.to_string()))?
        .ok_or_else(|| invalid("no private key found".to_string()))
}
