//! Transport error kinds.
//!
//! Every error here is terminal for a single connection only. The same
//! terminal error may be handed to several waiters (the protocol's
//! `connection_lost`, a producer parked in `drain`, the next `write`), so the
//! type is `Clone` and OS errors are shared behind an `Arc`.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Error reported to the protocol layer for one connection.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The peer terminated the connection abruptly (RST, broken pipe).
    #[error("connection reset by peer")]
    ConnectionReset,

    /// TLS negotiation failed before any application bytes flowed.
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    /// A bounded wait (flush deadline, handshake deadline) expired.
    #[error("operation timed out")]
    Timeout,

    /// The awaited operation was abandoned by a local forced close.
    #[error("operation cancelled")]
    OperationCancelled,

    /// Write attempted after `close` was requested.
    #[error("transport is closing")]
    Closing,

    /// Write attempted after the transport closed cleanly.
    #[error("transport is closed")]
    Closed,

    /// The connection registry no longer accepts connections (shutdown in progress).
    #[error("connection registry is closed to new connections")]
    RegistryClosed,

    /// Any other OS-level failure.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

impl TransportError {
    /// True for the abrupt-disconnect kind.
    pub fn is_reset(&self) -> bool {
        matches!(self, TransportError::ConnectionReset)
    }

    /// Label used for log fields and metric tags.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::ConnectionReset => "reset",
            TransportError::HandshakeFailed(_) => "handshake_failed",
            TransportError::Timeout => "timeout",
            TransportError::OperationCancelled => "cancelled",
            TransportError::Closing => "closing",
            TransportError::Closed => "closed",
            TransportError::RegistryClosed => "registry_closed",
            TransportError::Io(_) => "io",
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => TransportError::ConnectionReset,
            io::ErrorKind::TimedOut => TransportError::Timeout,
            _ => TransportError::Io(Arc::new(err)),
        }
    }
}
