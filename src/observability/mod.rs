//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Transports, listener, shutdown coordinator produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Connection id flows through every per-connection event
//! - Metrics are cheap (facade is a no-op without a recorder)

pub mod logging;
pub mod metrics;
