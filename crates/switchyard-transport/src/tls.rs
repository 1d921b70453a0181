//! TLS for tls:// endpoints.
//!
//! Servers present a PEM certificate chain and key. Clients verify the peer
//! against a PEM CA bundle, the bundled web PKI roots, or both.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::TransportError;

/// Install the ring crypto provider once per process.
pub fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = File::open(path)
        .map_err(|e| TransportError::Tls(format!("open {}: {e}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = File::open(path)
        .map_err(|e| TransportError::Tls(format!("open {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TransportError::Tls(format!("parse {}: {e}", path.display())))?
        .ok_or_else(|| TransportError::Tls(format!("no private key in {}", path.display())))
}

/// Build an acceptor from a certificate chain and private key.
pub fn server_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TransportError> {
    ensure_crypto_provider();
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Client-side TLS settings for outgoing tls:// connections.
#[derive(Clone)]
pub struct TlsClient {
    connector: TlsConnector,
    hostname: Option<String>,
}

impl std::fmt::Debug for TlsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsClient")
            .field("hostname", &self.hostname)
            .finish_non_exhaustive()
    }
}

impl TlsClient {
    /// `hostname` overrides the name checked against the server certificate;
    /// without it the endpoint host is used.
    pub fn new(
        ca_path: Option<&Path>,
        hostname: Option<&str>,
        trust_system: bool,
    ) -> Result<Self, TransportError> {
        ensure_crypto_provider();
        let mut roots = RootCertStore::empty();
        if trust_system {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        if let Some(path) = ca_path {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| TransportError::Tls(format!("CA {}: {e}", path.display())))?;
            }
        }
        if roots.is_empty() {
            return Err(TransportError::Tls("no trust roots configured".into()));
        }
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            hostname: hostname.filter(|h| !h.is_empty()).map(String::from),
        })
    }

    pub(crate) fn connector(&self) -> &TlsConnector {
        &self.connector
    }

    pub(crate) fn server_name(&self, endpoint_host: &str) -> Result<ServerName<'static>, TransportError> {
        let name = self.hostname.as_deref().unwrap_or(endpoint_host).to_string();
        ServerName::try_from(name.clone())
            .map_err(|_| TransportError::Tls(format!("invalid server name {name:?}")))
    }
}
