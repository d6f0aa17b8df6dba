//! Protocol-layer contract.
//!
//! A `Protocol` is the upper layer (HTTP, WebSocket, echo...) attached to one
//! transport. Every callback runs inside the connection's driver task, one at
//! a time and in event order, so implementations need no locking of their own.
//! Callbacks are synchronous: a protocol reacts by calling non-blocking
//! `Transport` methods (`write`, `begin_close`, `pause_reading`).

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::time::Instant;

use crate::transport::error::TransportError;
use crate::transport::stream::Transport;

/// WebSocket-compatible "going away" status, sent when the server shuts down.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Callbacks delivered by a transport to its protocol.
pub trait Protocol: Send + 'static {
    /// The transport is ready. Keep the handle to write later.
    fn connection_made(&mut self, transport: Transport) {
        let _ = transport;
    }

    /// Bytes arrived, in order.
    fn data_received(&mut self, data: Bytes);

    /// The peer closed its write side. Return `true` to keep the
    /// connection half-open, `false` to close it.
    fn eof_received(&mut self) -> bool {
        false
    }

    /// Terminal notification, delivered exactly once. `None` means an
    /// orderly close or a local abort.
    fn connection_lost(&mut self, error: Option<TransportError>) {
        let _ = error;
    }

    /// Pending writes exceeded the high watermark.
    fn pause_writing(&mut self) {}

    /// Pending writes dropped to the low watermark.
    fn resume_writing(&mut self) {}

    /// The server is shutting down. The default closes gracefully within
    /// the notice deadline; anything still unsent at the deadline is dropped.
    fn shutdown_requested(&mut self, transport: &Transport, notice: &ShutdownNotice) {
        transport.begin_close(Some(notice.remaining()));
    }
}

/// Fire-and-forget notice sent to every live connection when shutdown starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownNotice {
    status: u16,
    reason: String,
    deadline: Instant,
}

impl ShutdownNotice {
    pub fn new(status: u16, reason: impl Into<String>, deadline: Instant) -> Self {
        Self {
            status,
            reason: reason.into(),
            deadline,
        }
    }

    /// Close status code the protocol should report to its peer.
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Instant after which the coordinator force-closes the connection.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left until the deadline (zero once it has passed).
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Close payload: big-endian status code followed by the UTF-8 reason,
    /// the same layout as a WebSocket close frame body.
    pub fn close_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.reason.len());
        buf.put_u16(self.status);
        buf.put_slice(self.reason.as_bytes());
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_payload_layout() {
        let notice = ShutdownNotice::new(CLOSE_GOING_AWAY, "Server shutdown", Instant::now());
        let payload = notice.close_payload();
        assert_eq!(&payload[..2], &1001u16.to_be_bytes());
        assert_eq!(&payload[2..], b"Server shutdown");
    }

    #[tokio::test]
    async fn remaining_saturates_after_deadline() {
        let notice = ShutdownNotice::new(CLOSE_GOING_AWAY, "", Instant::now());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(notice.remaining(), Duration::ZERO);
    }
}
