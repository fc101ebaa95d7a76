//! Client-side TLS for collector sessions.
//!
//! The generator authenticates the collector against a configured CA and
//! presents its own certificate; there is no server side here.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::TlsConnector as TlsConnectorInner;

use crate::error::{Result, TransportError};

/// TLS material for a collector connection.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// PEM-encoded CA certificate(s) used to verify the collector.
    pub ca_cert_pem: Vec<u8>,
    /// PEM-encoded client certificate chain.
    pub cert_chain_pem: Vec<u8>,
    /// PEM-encoded client private key.
    pub private_key_pem: Vec<u8>,
}

impl TlsConfig {
    /// Creates a configuration from in-memory PEM data.
    pub fn new(ca_cert_pem: Vec<u8>, cert_chain_pem: Vec<u8>, private_key_pem: Vec<u8>) -> Self {
        Self {
            ca_cert_pem,
            cert_chain_pem,
            private_key_pem,
        }
    }

    /// Loads the TLS material from PEM files.
    pub fn from_files(ca_cert: &Path, certfile: &Path, keyfile: &Path) -> Result<Self> {
        Ok(Self {
            ca_cert_pem: std::fs::read(ca_cert).map_err(TransportError::IoError)?,
            cert_chain_pem: std::fs::read(certfile).map_err(TransportError::IoError)?,
            private_key_pem: std::fs::read(keyfile).map_err(TransportError::IoError)?,
        })
    }
}

/// Client-side TLS connector bound to a [`TlsConfig`].
pub struct TlsClient {
    inner: TlsConnectorInner,
}

impl fmt::Debug for TlsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsClient").finish()
    }
}

impl TlsClient {
    /// Builds a connector from configuration.
    pub fn new(config: &TlsConfig) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let certs = load_certs_from_pem(&config.cert_chain_pem)?;
        let key = load_private_key_from_pem(&config.private_key_pem)?;
        let ca_certs = load_certs_from_pem(&config.ca_cert_pem)?;

        let mut root_store = rustls::RootCertStore::empty();
        for cert in ca_certs {
            root_store.add(cert).map_err(|e| TransportError::TlsError {
                reason: format!("failed to add CA cert: {}", e),
            })?;
        }

        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_client_auth_cert(certs, key)
            .map_err(|e| TransportError::TlsError {
                reason: format!("failed to create client config: {}", e),
            })?;

        Ok(Self {
            inner: TlsConnectorInner::from(Arc::new(client_config)),
        })
    }

    /// Wraps a connected stream in TLS against the given server name.
    pub async fn connect<IO>(
        &self,
        domain: &str,
        stream: IO,
    ) -> Result<tokio_rustls::client::TlsStream<IO>>
    where
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let name = if let Ok(ip) = domain.parse::<std::net::IpAddr>() {
            ServerName::IpAddress(ip.into())
        } else {
            ServerName::try_from(domain.to_string()).map_err(|e| TransportError::TlsError {
                reason: format!("invalid server name: {}", e),
            })?
        };
        self.inner
            .connect(name, stream)
            .await
            .map_err(|e| TransportError::TlsError {
                reason: format!("TLS handshake failed: {}", e),
            })
    }
}

/// Loads certificates from PEM-encoded data.
fn load_certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut certs = Vec::new();
    let mut cursor = std::io::Cursor::new(pem);
    while let Ok(Some(rustls_pemfile::Item::X509Certificate(cert))) =
        rustls_pemfile::read_one(&mut cursor)
    {
        certs.push(cert);
    }
    if certs.is_empty() {
        return Err(TransportError::TlsError {
            reason: "no certificates found in PEM data".into(),
        });
    }
    Ok(certs)
}

/// Loads a private key from PEM-encoded data.
fn load_private_key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut cursor = std::io::Cursor::new(pem);
    rustls_pemfile::private_key(&mut cursor)
        .map_err(|e| TransportError::TlsError {
            reason: format!("failed to parse private key: {}", e),
        })?
        .ok_or_else(|| TransportError::TlsError {
            reason: "no private key found in PEM data".into(),
        })
}
