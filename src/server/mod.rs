//! Accept loop: listener → optional TLS → transport.
//!
//! # Responsibilities
//! - Accept connections under the connection limit
//! - Run the TLS handshake (bounded) when configured
//! - Start one transport per connection, registered for shutdown
//! - Stop accepting as soon as the shutdown coordinator leaves `Idle`
//!
//! # Design Decisions
//! - Handshakes run in the per-connection task, never in the accept loop
//! - The connection permit is held until the transport is `Closed`
//! - Connections that finish their handshake after shutdown began are
//!   refused by the sealed registry and dropped

pub mod echo;

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::config::TransportConfig;
use crate::lifecycle::ShutdownPhase;
use crate::net::listener::{ConnectionPermit, Listener, ListenerError};
use crate::net::registry::ConnectionRegistry;
use crate::net::tls::{TlsServer, TlsSetupError};
use crate::transport::error::TransportError;
use crate::transport::flow::WatermarkError;
use crate::transport::protocol::Protocol;
use crate::transport::stream::{TransportBuilder, TransportOptions};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Tls(#[from] TlsSetupError),

    #[error("invalid flow control settings: {0}")]
    FlowControl(#[from] WatermarkError),
}

/// TCP/TLS server that hands every connection to a fresh protocol instance.
pub struct TransportServer {
    listener: Listener,
    tls: Option<TlsServer>,
    options: TransportOptions,
    registry: ConnectionRegistry,
}

impl TransportServer {
    /// Bind the listener and load TLS material when configured.
    pub async fn bind(config: &TransportConfig, registry: ConnectionRegistry) -> Result<Self, ServerError> {
        let options = config.transport_options()?;
        let tls = match &config.listener.tls {
            Some(tls) => Some(TlsServer::from_config(tls)?),
            None => None,
        };
        let listener = Listener::bind(&config.listener).await?;
        Ok(Self {
            listener,
            tls,
            options,
            registry,
        })
    }

    /// Replace the TLS settings loaded from config.
    pub fn with_tls(mut self, tls: TlsServer) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Accept connections until `shutdown` leaves `Idle`, then close the
    /// listening socket. Live connections are left to the shutdown coordinator.
    pub async fn run<F, P>(
        self,
        factory: F,
        mut shutdown: watch::Receiver<ShutdownPhase>,
    ) -> Result<(), ServerError>
    where
        F: Fn() -> P + Send + Sync + 'static,
        P: Protocol,
    {
        let factory = Arc::new(factory);
        tracing::info!(
            address = ?self.listener.local_addr().ok(),
            tls = self.tls.is_some(),
            "Accepting connections"
        );

        loop {
            tokio::select! {
                _ = stop_requested(&mut shutdown) => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr, permit)) => {
                        self.serve(stream, peer_addr, permit, factory.clone());
                    }
                    Err(ListenerError::Accept(err)) => {
                        // Usually transient (EMFILE, ECONNABORTED); keep accepting.
                        tracing::warn!(error = %err, "Accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                    Err(err) => return Err(err.into()),
                },
            }
        }

        tracing::info!(
            live_connections = self.registry.len(),
            "Stopped accepting connections"
        );
        Ok(())
    }

    fn serve<F, P>(&self, stream: TcpStream, peer_addr: SocketAddr, permit: ConnectionPermit, factory: Arc<F>)
    where
        F: Fn() -> P + Send + Sync + 'static,
        P: Protocol,
    {
        let tls = self.tls.clone();
        let registry = self.registry.clone();
        let mut builder = TransportBuilder::new(self.options)
            .peer_addr(peer_addr)
            .registry(registry.clone());
        if let Ok(local_addr) = stream.local_addr() {
            builder = builder.local_addr(local_addr);
        }

        tokio::spawn(async move {
            let _permit = permit;
            let spawned = match tls {
                Some(tls) => match tls.accept(stream).await {
                    Ok((stream, session)) => builder.tls_session(session).spawn(stream, factory()),
                    Err(err) => {
                        tracing::warn!(
                            peer_addr = %peer_addr,
                            error = %err,
                            during_shutdown = registry.is_sealed(),
                            "TLS handshake failed"
                        );
                        return;
                    }
                },
                None => builder.spawn(stream, factory()),
            };

            match spawned {
                Ok(transport) => transport.wait_closed().await,
                Err(TransportError::RegistryClosed) => {
                    tracing::debug!(peer_addr = %peer_addr, "Shutting down, connection refused");
                }
                Err(err) => {
                    tracing::warn!(peer_addr = %peer_addr, error = %err, "Failed to start transport");
                }
            }
        });
    }
}

/// Resolve once the coordinator leaves `Idle` (or is dropped).
async fn stop_requested(shutdown: &mut watch::Receiver<ShutdownPhase>) {
    // Drop the `Ref` here; holding it would make the accept loop `!Send`.
    let _ = shutdown.wait_for(|phase| *phase != ShutdownPhase::Idle).await;
}

impl std::fmt::Debug for TransportServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportServer")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("tls", &self.tls.is_some())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
