//! Echo server on top of the transport core.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──TCP/TLS──▶ net::listener ──▶ net::tls (optional handshake)
//!                               │
//!                               ▼
//!                      transport (one driver task per connection)
//!                               │  ▲
//!                 Protocol callbacks  write / close / backpressure
//!                               ▼  │
//!                          server::echo
//!
//!     SIGINT/SIGTERM ──▶ lifecycle::shutdown ──▶ registry snapshot
//!                          │   notice (1001 "Server shutdown") to every connection
//!                          └── abort stragglers at the grace deadline
//! ```

use std::path::PathBuf;

use clap::Parser;

use transport_core::config::{self, TransportConfig};
use transport_core::lifecycle::signals::shutdown_signal;
use transport_core::observability::{logging, metrics};
use transport_core::server::echo::EchoProtocol;
use transport_core::{ConnectionRegistry, ShutdownCoordinator, TransportServer};

#[derive(Parser)]
#[command(name = "transport-core")]
#[command(about = "Echo server with backpressure, TLS and graceful shutdown", long_about = None)]
struct Args {
    /// Path to a TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => config::load_config(path)?,
        None => TransportConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.listener.bind_address = bind;
        config::validation::validate_config(&config).map_err(config::ConfigError::Validation)?;
    }

    logging::init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "transport-core starting");

    if config.observability.metrics_enabled {
        metrics::init_metrics(config.observability.metrics_address.parse()?)?;
    }

    let registry = ConnectionRegistry::new();
    let coordinator = ShutdownCoordinator::new(registry.clone(), config.shutdown.clone());
    let server = TransportServer::bind(&config, registry).await?;

    tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            shutdown_signal().await;
            coordinator.trigger();
        }
    });

    server.run(EchoProtocol::new, coordinator.subscribe()).await?;

    let report = coordinator.wait_done().await;
    tracing::info!(
        drained = report.drained,
        aborted = report.aborted,
        elapsed = ?report.elapsed,
        "Shutdown complete"
    );
    Ok(())
}
