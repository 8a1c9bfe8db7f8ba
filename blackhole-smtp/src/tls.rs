//! TLS material loading and cipher introspection.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio_rustls::rustls::{
    crypto::ring,
    pki_types::{CertificateDer, PrivateKeyDer},
    ServerConfig,
};

/// Errors raised while preparing the TLS context.
#[derive(Debug, Error)]
pub enum TlsError {
    /// Failed to load the certificate chain.
    #[error("Failed to load TLS certificate from {path}: {reason}")]
    CertificateLoad { path: String, reason: String },

    /// Failed to load the private key.
    #[error("Failed to load TLS private key from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    /// Rustls rejected the material.
    #[error("TLS error: {0}")]
    Rustls(String),
}

impl From<tokio_rustls::rustls::Error> for TlsError {
    fn from(err: tokio_rustls::rustls::Error) -> Self {
        Self::Rustls(err.to_string())
    }
}

/// Loads certificate and key into a server context shared by all
/// listeners of the process.
pub fn load_server_config(cert: &Path, key: &Path) -> Result<Arc<ServerConfig>, TlsError> {
    let certs = load_certs(cert)?;
    let key = load_key(key)?;

    let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mapped = |reason: String| TlsError::CertificateLoad {
        path: path.display().to_string(),
        reason,
    };

    let file = File::open(path).map_err(|e| mapped(e.to_string()))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|e| mapped(e.to_string()))?;

    if certs.is_empty() {
        return Err(mapped("no certificates found".to_string()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mapped = |reason: String| TlsError::KeyLoad {
        path: path.display().to_string(),
        reason,
    };

    let file = File::open(path).map_err(|e| mapped(e.to_string()))?;
    let mut reader = BufReader::new(file);

    match rustls_pemfile::read_one(&mut reader).map_err(|e| mapped(e.to_string()))? {
        Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
        Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
        Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
        _ => Err(mapped(
            "unable to determine key file format (expected PKCS1, PKCS8, or SEC1)".to_string(),
        )),
    }
}

/// Human readable protocol and cipher suite list for the `-l` flag.
#[must_use]
pub fn supported_parameters() -> Vec<String> {
    ring::default_provider()
        .cipher_suites
        .iter()
        .map(|suite| {
            let version = suite
                .version()
                .version
                .as_str()
                .unwrap_or("unknown");
            let name = suite.suite().as_str().unwrap_or("unknown");
            format!("{version} {name}")
        })
        .collect()
}
