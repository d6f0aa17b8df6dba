//! Async stream transport core.
//!
//! Buffered, flow-controlled TCP/TLS transports with a connection registry
//! and a graceful shutdown coordinator.

pub mod config;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod server;
pub mod transport;

pub use config::TransportConfig;
pub use lifecycle::{ShutdownCoordinator, ShutdownPhase, ShutdownReport};
pub use net::connection::{ConnectionId, LifecycleState};
pub use net::registry::ConnectionRegistry;
pub use server::TransportServer;
pub use transport::{Protocol, Transport, TransportBuilder, TransportError};
