//! Stream transport subsystem.
//!
//! # Data Flow
//! ```text
//! accepted / connected socket (TCP, or TLS via net::tls)
//!     → stream.rs (TransportBuilder::spawn, Transport handle)
//!     → driver.rs (one task per connection, owns the socket)
//!     → protocol.rs (callbacks into the upper layer)
//!     → reader.rs (optional pull-style adapter)
//!
//! Lifecycle:
//!     Open → Closing → Closed
//!     Open → Closed           (reset, I/O error, abort)
//! ```
//!
//! # Design Decisions
//! - Writes never block: they queue and report backpressure through the
//!   flow state (flow.rs), sampled synchronously after each enqueue
//! - Errors are terminal per connection and never escape to other connections
//! - Closing is idempotent and reported to the protocol exactly once

mod driver;
pub mod error;
pub mod flow;
pub mod protocol;
pub mod reader;
pub mod stream;

pub use error::TransportError;
pub use flow::{FlowState, Watermarks};
pub use protocol::{Protocol, ShutdownNotice, CLOSE_GOING_AWAY};
pub use reader::{ChannelProtocol, Inbound, StreamReader};
pub use stream::{Transport, TransportBuilder, TransportOptions};
