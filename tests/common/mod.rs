//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use transport_core::config::TransportConfig;
use transport_core::net::tls::{self, TlsClient, TlsServer};
use transport_core::server::ServerError;
use transport_core::transport::reader::{self, StreamReader, DEFAULT_READ_LIMIT};
use transport_core::transport::{Protocol, Transport, TransportBuilder, TransportError, TransportOptions};
use transport_core::{ConnectionRegistry, ShutdownCoordinator, TransportServer};

pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

pub fn tls_server() -> TlsServer {
    let config = tls::server_config(&fixture("server.pem"), &fixture("server.key"), &[]).unwrap();
    TlsServer::new(Arc::new(config), Duration::from_secs(2))
}

pub fn tls_client() -> TlsClient {
    TlsClient::from_ca_file(&fixture("ca.pem")).unwrap()
}

/// Defaults, bound to an ephemeral local port.
pub fn test_config(grace_ms: u64) -> TransportConfig {
    let mut config = TransportConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.shutdown.grace_period_ms = grace_ms;
    config
}

/// A running server plus the handles tests need to drive it.
pub struct Harness {
    pub addr: SocketAddr,
    pub registry: ConnectionRegistry,
    pub coordinator: ShutdownCoordinator,
    pub server: JoinHandle<Result<(), ServerError>>,
}

pub async fn start_server<F, P>(config: TransportConfig, tls: Option<TlsServer>, factory: F) -> Harness
where
    F: Fn() -> P + Send + Sync + 'static,
    P: Protocol,
{
    let registry = ConnectionRegistry::new();
    let coordinator = ShutdownCoordinator::new(registry.clone(), config.shutdown.clone());
    let mut server = TransportServer::bind(&config, registry.clone()).await.unwrap();
    if let Some(tls) = tls {
        server = server.with_tls(tls);
    }
    let addr = server.local_addr().unwrap();
    let stop = coordinator.subscribe();
    let server = tokio::spawn(server.run(factory, stop));
    Harness {
        addr,
        registry,
        coordinator,
        server,
    }
}

/// Client transport plus a pull-style reader over its inbound bytes.
pub async fn connect(addr: SocketAddr, use_tls: bool) -> (Transport, StreamReader) {
    let (protocol, reader) = reader::channel(DEFAULT_READ_LIMIT);
    let builder = TransportBuilder::new(TransportOptions::default());
    let transport = if use_tls {
        tls_client()
            .open(builder, addr, "localhost", protocol)
            .await
            .unwrap()
    } else {
        builder.connect(addr, protocol).await.unwrap()
    };
    (transport, reader)
}

/// Close the socket with an RST instead of a FIN.
pub fn reset_on_drop(stream: &TcpStream) {
    socket2::SockRef::from(stream)
        .set_linger(Some(Duration::ZERO))
        .unwrap();
}

pub async fn eventually<F: Fn() -> bool>(timeout: Duration, condition: F) {
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Server-side protocol that hands its transport to the test and records
/// how the connection ended.
pub struct Capture {
    transports: mpsc::UnboundedSender<Transport>,
    lost: mpsc::UnboundedSender<Option<TransportError>>,
    obey_shutdown: bool,
}

pub struct Captured {
    pub transports: mpsc::UnboundedReceiver<Transport>,
    pub lost: mpsc::UnboundedReceiver<Option<TransportError>>,
}

/// Factory for `Capture` protocols. With `obey_shutdown == false` the
/// protocol ignores shutdown notices and must be force-closed.
pub fn capture(obey_shutdown: bool) -> (impl Fn() -> Capture + Send + Sync + 'static, Captured) {
    let (transports_tx, transports) = mpsc::unbounded_channel();
    let (lost_tx, lost) = mpsc::unbounded_channel();
    let factory = move || Capture {
        transports: transports_tx.clone(),
        lost: lost_tx.clone(),
        obey_shutdown,
    };
    (factory, Captured { transports, lost })
}

impl Protocol for Capture {
    fn connection_made(&mut self, transport: Transport) {
        let _ = self.transports.send(transport);
    }

    fn data_received(&mut self, _data: Bytes) {}

    fn connection_lost(&mut self, error: Option<TransportError>) {
        let _ = self.lost.send(error);
    }

    fn shutdown_requested(&mut self, transport: &Transport, notice: &transport_core::transport::ShutdownNotice) {
        if self.obey_shutdown {
            transport.begin_close(Some(notice.remaining()));
        }
    }
}

impl Captured {
    pub async fn next_transport(&mut self) -> Transport {
        tokio::time::timeout(Duration::from_secs(5), self.transports.recv())
            .await
            .expect("no connection accepted in time")
            .expect("server gone")
    }

    pub async fn next_lost(&mut self) -> Option<TransportError> {
        tokio::time::timeout(Duration::from_secs(5), self.lost.recv())
            .await
            .expect("connection_lost not delivered in time")
            .expect("server gone")
    }
}
