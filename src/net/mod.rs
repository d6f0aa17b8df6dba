//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → tls.rs (optional TLS handshake)
//!     → transport (buffered, flow-controlled stream)
//!     → registry.rs (tracked until Closed, for graceful shutdown)
//!
//! Connection States (connection.rs):
//!     Open → Closing → Closed
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - TLS is optional and handled transparently

pub mod connection;
pub mod listener;
pub mod registry;
pub mod tls;
