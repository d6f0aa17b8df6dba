//! TLS wrapper.
//!
//! # Responsibilities
//! - Load certificates and keys (PEM) into rustls configs
//! - Run the server or client handshake under a deadline
//! - Hand the encrypted stream to a `Transport`, which treats it exactly
//!   like a plain socket (same buffering, watermarks and close semantics)
//!
//! # Design Decisions
//! - Every handshake failure, including a peer reset or a deadline, is
//!   reported as `HandshakeFailed`; after the handshake a reset is a
//!   plain `ConnectionReset`
//! - The ring crypto provider is passed explicitly so no process-wide
//!   default provider has to be installed

use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::{self, pki_types, ClientConfig, CommonState, RootCertStore, ServerConfig};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use crate::config::TlsConfig;
use crate::observability::metrics;
use crate::transport::error::TransportError;
use crate::transport::protocol::Protocol;
use crate::transport::stream::{Transport, TransportBuilder};

/// Default handshake deadline.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Error building a TLS configuration.
#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Parameters negotiated during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSession {
    pub protocol_version: Option<String>,
    pub cipher_suite: Option<String>,
    pub alpn_protocol: Option<Vec<u8>>,
    /// SNI sent by the client (server side) or the name verified (client side).
    pub server_name: Option<String>,
}

impl TlsSession {
    fn from_state(state: &CommonState, server_name: Option<String>) -> Self {
        Self {
            protocol_version: state.protocol_version().map(|v| format!("{:?}", v)),
            cipher_suite: state
                .negotiated_cipher_suite()
                .map(|suite| format!("{:?}", suite.suite())),
            alpn_protocol: state.alpn_protocol().map(|p| p.to_vec()),
            server_name,
        }
    }
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn open(path: &Path) -> Result<BufReader<File>, TlsSetupError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsSetupError::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// Read every certificate in a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<pki_types::CertificateDer<'static>>, TlsSetupError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsSetupError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsSetupError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// Read the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM file.
pub fn load_private_key(path: &Path) -> Result<pki_types::PrivateKeyDer<'static>, TlsSetupError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsSetupError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsSetupError::NoPrivateKey(path.to_path_buf()))
}

/// Build a server config from a certificate chain and key on disk.
pub fn server_config(
    cert_path: &Path,
    key_path: &Path,
    alpn_protocols: &[String],
) -> Result<ServerConfig, TlsSetupError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let mut config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = alpn_protocols.iter().map(|p| p.as_bytes().to_vec()).collect();
    Ok(config)
}

/// Build a client config that trusts only the CAs in `ca_path`.
pub fn client_config(ca_path: &Path, alpn_protocols: &[String]) -> Result<ClientConfig, TlsSetupError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        roots.add(cert)?;
    }

    let mut config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn_protocols.iter().map(|p| p.as_bytes().to_vec()).collect();
    Ok(config)
}

fn handshake_error(err: impl std::fmt::Display) -> TransportError {
    metrics::record_handshake_failure();
    TransportError::HandshakeFailed(err.to_string())
}

/// Server-side TLS handshakes for accepted connections.
#[derive(Clone)]
pub struct TlsServer {
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl TlsServer {
    pub fn new(config: Arc<ServerConfig>, handshake_timeout: Duration) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
            handshake_timeout,
        }
    }

    pub fn from_config(config: &TlsConfig) -> Result<Self, TlsSetupError> {
        let server = server_config(
            Path::new(&config.cert_path),
            Path::new(&config.key_path),
            &config.alpn_protocols,
        )?;
        tracing::info!(
            cert_path = %config.cert_path,
            alpn = ?config.alpn_protocols,
            "TLS enabled"
        );
        Ok(Self::new(Arc::new(server), config.handshake_timeout()))
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Run the server handshake on an accepted stream.
    pub async fn accept<IO>(&self, stream: IO) -> Result<(server::TlsStream<IO>, TlsSession), TransportError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let tls = match tokio::time::timeout(self.handshake_timeout, self.acceptor.accept(stream)).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(err)) => return Err(handshake_error(err)),
            Err(_) => {
                return Err(handshake_error(format!(
                    "no handshake within {:?}",
                    self.handshake_timeout
                )))
            }
        };

        let (_, conn) = tls.get_ref();
        let session = TlsSession::from_state(conn, conn.server_name().map(str::to_owned));
        tracing::trace!(
            version = ?session.protocol_version,
            cipher_suite = ?session.cipher_suite,
            "TLS handshake complete"
        );
        Ok((tls, session))
    }
}

impl std::fmt::Debug for TlsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsServer")
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

/// Client-side TLS handshakes for outgoing connections.
#[derive(Clone)]
pub struct TlsClient {
    connector: TlsConnector,
    handshake_timeout: Duration,
}

impl TlsClient {
    pub fn new(config: Arc<ClientConfig>, handshake_timeout: Duration) -> Self {
        Self {
            connector: TlsConnector::from(config),
            handshake_timeout,
        }
    }

    /// Client trusting the CAs in `ca_path`, with the default handshake deadline.
    pub fn from_ca_file(ca_path: &Path) -> Result<Self, TlsSetupError> {
        let config = client_config(ca_path, &[])?;
        Ok(Self::new(Arc::new(config), DEFAULT_HANDSHAKE_TIMEOUT))
    }

    /// Run the client handshake, verifying the peer against `server_name`.
    pub async fn connect<IO>(
        &self,
        server_name: &str,
        stream: IO,
    ) -> Result<(client::TlsStream<IO>, TlsSession), TransportError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let name = pki_types::ServerName::try_from(server_name.to_owned())
            .map_err(|err| handshake_error(format!("invalid server name {:?}: {}", server_name, err)))?;

        let tls = match tokio::time::timeout(self.handshake_timeout, self.connector.connect(name, stream)).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(err)) => return Err(handshake_error(err)),
            Err(_) => {
                return Err(handshake_error(format!(
                    "no handshake within {:?}",
                    self.handshake_timeout
                )))
            }
        };

        let (_, conn) = tls.get_ref();
        let session = TlsSession::from_state(conn, Some(server_name.to_owned()));
        Ok((tls, session))
    }

    /// Connect over TCP, complete the handshake and start a transport.
    pub async fn open<P: Protocol>(
        &self,
        builder: TransportBuilder,
        addr: SocketAddr,
        server_name: &str,
        protocol: P,
    ) -> Result<Transport, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let (tls, session) = self.connect(server_name, stream).await?;
        builder
            .peer_addr(addr)
            .local_addr(local_addr)
            .tls_session(session)
            .spawn(tls, protocol)
    }
}

impl std::fmt::Debug for TlsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsClient")
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}
