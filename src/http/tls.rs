//! TLS acceptor construction for HTTPS serving.
//!
//! Certificates and keys are read from PEM files once, when the server starts.
//! The handshake itself runs in each connection's task so a slow client
//! cannot stall the accept loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::ServerConfig;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("Failed to load certificates from {}: {message}", path.display())]
    Certificate { path: PathBuf, message: String },

    #[error("Failed to load private key from {}: {message}", path.display())]
    PrivateKey { path: PathBuf, message: String },

    #[error("No certificates found in {}", path.display())]
    EmptyChain { path: PathBuf },

    #[error("Invalid TLS configuration: {0}")]
    Config(#[from] rustls::Error),
}

/// Build an acceptor from a PEM certificate chain and private key.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TlsError> {
    let certs = CertificateDer::pem_file_iter(cert_path)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .map_err(|e| TlsError::Certificate {
            path: cert_path.to_path_buf(),
            message: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(TlsError::EmptyChain {
            path: cert_path.to_path_buf(),
        });
    }

    let key = PrivateKeyDer::from_pem_file(key_path).map_err(|e| TlsError::PrivateKey {
        path: key_path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    tracing::debug!(cert = %cert_path.display(), key = %key_path.display(), "Loaded TLS certificates");

    Ok(TlsAcceptor::from(Arc::new(config)))
}
