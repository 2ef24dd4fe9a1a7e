//! TLS configuration and certificate loading.
//!
//! # Responsibilities
//! - Load the certificate chain and private key from PEM files
//! - Build a hardened `rustls::ServerConfig` (TLS 1.2+, AEAD suites only)
//! - Build the client configuration used to reach https/wss backends
//! - Terminate TLS on top of any [`StreamListener`]
//!
//! # Design Decisions
//! - Handshakes run on per-connection tasks behind a bounded queue
//! - A failed or slow handshake only drops that connection

use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedCipherSuite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::net::handoff::Handoff;
use crate::net::listener::StreamListener;
use crate::net::stream::Connection;

/// Error type for TLS setup.
#[derive(Debug, thiserror::Error)]
pub enum TlsSetupError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),
    #[error("invalid TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Certificate chain and key ready to hand to rustls.
pub struct CertifiedKeyPair {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

fn open(path: &Path) -> Result<BufReader<File>, TlsSetupError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsSetupError::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// Load a PEM certificate chain and the first private key found in `key_path`.
pub fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKeyPair, TlsSetupError> {
    let chain = rustls_pemfile::certs(&mut open(cert_path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsSetupError::Read {
            path: cert_path.to_path_buf(),
            source,
        })?;
    if chain.is_empty() {
        return Err(TlsSetupError::NoCertificates(cert_path.to_path_buf()));
    }

    let key = rustls_pemfile::private_key(&mut open(key_path)?)
        .map_err(|source| TlsSetupError::Read {
            path: key_path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsSetupError::NoPrivateKey(key_path.to_path_buf()))?;

    Ok(CertifiedKeyPair { chain, key })
}

/// AEAD-only suites. RC4 and CBC constructions are never offered.
pub fn allowed_cipher_suites() -> Vec<SupportedCipherSuite> {
    use ring::cipher_suite::*;
    vec![
        TLS13_AES_128_GCM_SHA256,
        TLS13_AES_256_GCM_SHA384,
        TLS13_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    ]
}

/// Crypto provider restricted to [`allowed_cipher_suites`].
pub fn hardened_provider() -> CryptoProvider {
    CryptoProvider {
        cipher_suites: allowed_cipher_suites(),
        ..ring::default_provider()
    }
}

/// Build the server-side TLS configuration.
pub fn server_config(material: CertifiedKeyPair) -> Result<ServerConfig, TlsSetupError> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(hardened_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
        .with_no_client_auth()
        .with_single_cert(material.chain, material.key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

/// Load TLS configuration from certificate and key files.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>, TlsSetupError> {
    let material = load_certified_key(cert_path, key_path)?;
    let config = server_config(material)?;
    tracing::info!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        "TLS material loaded"
    );
    Ok(Arc::new(config))
}

/// Client configuration for https/wss backends.
///
/// Trusts the system roots plus every certificate in `ca_file`, if given.
pub fn backend_client_config(ca_file: Option<&Path>) -> Result<Arc<ClientConfig>, TlsSetupError> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        tracing::warn!(error = %e, "Failed to load a system root certificate");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::debug!(added, ignored, "System root certificates loaded");

    if let Some(path) = ca_file {
        let certs = rustls_pemfile::certs(&mut open(path)?)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| TlsSetupError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        if certs.is_empty() {
            return Err(TlsSetupError::NoCertificates(path.to_path_buf()));
        }
        for cert in certs {
            roots.add(cert)?;
        }
        tracing::info!(ca_file = %path.display(), "Backend CA certificates loaded");
    }

    let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Terminates TLS on connections produced by an inner listener.
pub struct TlsListener<S> {
    queue: Handoff<TlsStream<S>>,
}

impl<S: Connection> TlsListener<S> {
    pub fn new<L>(
        inner: L,
        config: Arc<ServerConfig>,
        queue_capacity: usize,
        handshake_timeout: Duration,
    ) -> io::Result<Self>
    where
        L: StreamListener<Io = S>,
    {
        let acceptor = TlsAcceptor::from(config);
        let queue = Handoff::spawn(inner, queue_capacity, move |io, remote| {
            let acceptor = acceptor.clone();
            async move {
                match tokio::time::timeout(handshake_timeout, acceptor.accept(io)).await {
                    Ok(Ok(stream)) => Some((stream, remote)),
                    Ok(Err(e)) => {
                        tracing::debug!(peer_addr = %remote, error = %e, "TLS handshake failed");
                        None
                    }
                    Err(_) => {
                        tracing::debug!(peer_addr = %remote, "TLS handshake timed out");
                        None
                    }
                }
            }
        })?;
        Ok(Self { queue })
    }

    pub fn close(&self) {
        self.queue.close();
    }
}

impl<S: Connection> StreamListener for TlsListener<S> {
    type Io = TlsStream<S>;

    fn accept(
        &mut self,
    ) -> impl std::future::Future<Output = io::Result<(Self::Io, SocketAddr)>> + Send {
        self.queue.accept()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.queue.local_addr())
    }
}
