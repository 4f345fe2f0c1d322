//! TLS termination — certificate resolution per ClientHello
//!
//! The core doesn't own certificate acquisition; it consumes a single
//! callback through [`CertificateProvider`] and adapts it to rustls'
//! `ResolvesServerCert`. The bundled provider serves one PEM keypair for
//! every hostname (local development with mkcert or similar).

use crate::error::{EdgeError, Result};
use rustls::crypto::ring::sign::any_supported_type;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// External certificate source, queried once per TLS handshake
pub trait CertificateProvider: Send + Sync + std::fmt::Debug {
    /// Certificate for the SNI hostname (`None` when the client sent none)
    fn resolve(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>>;
}

/// Always returns the same keypair. We're assuming the user only needs one
/// hostname, or that it's a wildcard certificate.
#[derive(Debug)]
pub struct StaticCertProvider {
    key: Arc<CertifiedKey>,
}

impl StaticCertProvider {
    /// Load certificate chain + private key from one PEM file
    pub fn from_pem_file(path: &Path) -> Result<Self> {
        let open = || {
            std::fs::File::open(path).map_err(|e| {
                EdgeError::Tls(format!("open certificate {}: {}", path.display(), e))
            })
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(open()?))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| EdgeError::Tls(format!("parse certificate: {}", e)))?;

        if certs.is_empty() {
            return Err(EdgeError::Tls(format!(
                "no certificates found in {}",
                path.display()
            )));
        }

        let key = rustls_pemfile::private_key(&mut BufReader::new(open()?))
            .map_err(|e| EdgeError::Tls(format!("parse private key: {}", e)))?
            .ok_or_else(|| EdgeError::Tls(format!("no private key found in {}", path.display())))?;

        let signing_key = any_supported_type(&key)
            .map_err(|e| EdgeError::Tls(format!("unusable private key: {}", e)))?;

        Ok(Self {
            key: Arc::new(CertifiedKey::new(certs, signing_key)),
        })
    }
}

impl CertificateProvider for StaticCertProvider {
    fn resolve(&self, _server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        Some(self.key.clone())
    }
}

#[derive(Debug)]
struct ProviderResolver {
    provider: Arc<dyn CertificateProvider>,
}

impl ResolvesServerCert for ProviderResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.provider.resolve(client_hello.server_name())
    }
}

/// Acceptor with per-handshake certificate resolution.
/// Minimum TLS version is purposefully left at the library default — an
/// edge router conservatively has to support a wide base of clients.
pub fn build_tls_acceptor(provider: Arc<dyn CertificateProvider>) -> TlsAcceptor {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(ProviderResolver { provider }));

    TlsAcceptor::from(Arc::new(config))
}
