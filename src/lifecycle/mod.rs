//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!
//! Shutdown (shutdown.rs):
//!     Seal registry → Stop accepting → Notify connections
//!     → Wait for grace period → Abort stragglers → Done
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, close
//! - Shutdown has timeout: forced close after deadline

pub mod shutdown;
pub mod signals;

pub use shutdown::{SessionOutcome, ShutdownCoordinator, ShutdownPhase, ShutdownReport};
