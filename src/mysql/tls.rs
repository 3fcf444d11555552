//! Server-side TLS for the SSLRequest upgrade.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;

use crate::config::TlsConfig;
use crate::error::{FrontendError, Result};

/// Negotiated parameters exposed to sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    pub version: String,
    pub cipher: String,
}

#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl TlsAcceptor {
    /// Build from PEM files. Returns `Ok(None)` when TLS is not configured.
    pub fn from_config(config: &TlsConfig) -> Result<Option<Self>> {
        let (cert_path, key_path) = match (&config.cert_path, &config.key_path) {
            (Some(cert), Some(key)) => (cert, key),
            (None, None) => return Ok(None),
            _ => {
                return Err(FrontendError::Tls(
                    "cert_path and key_path must be set together".to_string(),
                ))
            }
        };

        let certs = load_certificates(Path::new(cert_path))?;
        if certs.is_empty() {
            return Err(FrontendError::Tls(format!(
                "no certificates found in {}",
                cert_path
            )));
        }
        let key = load_private_key(Path::new(key_path))?;

        let provider = rustls::crypto::ring::default_provider();
        let server_config = ServerConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| FrontendError::Tls(format!("Failed to set protocol versions: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| FrontendError::Tls(format!("Failed to build TLS config: {}", e)))?;

        Ok(Some(Self {
            inner: tokio_rustls::TlsAcceptor::from(Arc::new(server_config)),
        }))
    }

    pub async fn accept_stream<S>(&self, stream: S) -> Result<TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.inner
            .accept(stream)
            .await
            .map_err(|e| FrontendError::Tls(format!("handshake failed: {}", e)))
    }
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| FrontendError::Tls(format!("cannot open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| FrontendError::Tls(format!("cannot parse {}: {}", path.display(), e)))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| FrontendError::Tls(format!("cannot open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| FrontendError::Tls(format!("cannot parse {}: {}", path.display(), e)))?
        .ok_or_else(|| FrontendError::Tls(format!("no private key found in {}", path.display())))
}
