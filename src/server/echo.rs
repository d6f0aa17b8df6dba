//! Echo protocol.
//!
//! Writes every received chunk back to the peer. Backpressure is passed
//! through: while the peer is not reading our echoes, we stop reading its
//! input. On shutdown the close payload (status + reason) is sent as the last
//! bytes before the transport closes.

use bytes::Bytes;

use crate::transport::error::TransportError;
use crate::transport::protocol::{Protocol, ShutdownNotice};
use crate::transport::stream::Transport;

#[derive(Debug, Default)]
pub struct EchoProtocol {
    transport: Option<Transport>,
}

impl EchoProtocol {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Protocol for EchoProtocol {
    fn connection_made(&mut self, transport: Transport) {
        tracing::debug!(
            connection_id = %transport.id(),
            peer_addr = ?transport.peer_addr(),
            "Echo session started"
        );
        self.transport = Some(transport);
    }

    fn data_received(&mut self, data: Bytes) {
        if let Some(transport) = &self.transport {
            if let Err(err) = transport.write(data) {
                tracing::debug!(connection_id = %transport.id(), error = %err, "Echo write rejected");
            }
        }
    }

    fn connection_lost(&mut self, error: Option<TransportError>) {
        if let Some(transport) = self.transport.take() {
            tracing::debug!(
                connection_id = %transport.id(),
                error = ?error.map(|e| e.kind()),
                "Echo session ended"
            );
        }
    }

    fn pause_writing(&mut self) {
        if let Some(transport) = &self.transport {
            transport.pause_reading();
        }
    }

    fn resume_writing(&mut self) {
        if let Some(transport) = &self.transport {
            transport.resume_reading();
        }
    }

    fn shutdown_requested(&mut self, transport: &Transport, notice: &ShutdownNotice) {
        if let Err(err) = transport.write(notice.close_payload()) {
            tracing::debug!(connection_id = %transport.id(), error = %err, "Close payload not sent");
        }
        transport.begin_close(Some(notice.remaining()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::stream::TransportOptions;
    use crate::transport::TransportBuilder;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn echoes_bytes_back() {
        let (local, mut peer) = tokio::io::duplex(1024);
        let _transport = TransportBuilder::new(TransportOptions::default())
            .spawn(local, EchoProtocol::new())
            .unwrap();

        peer.write_all(b"hello, transport").await.unwrap();
        let mut buf = [0u8; 16];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello, transport");
    }

    #[tokio::test]
    async fn shutdown_notice_sends_close_payload_then_eof() {
        let (local, mut peer) = tokio::io::duplex(1024);
        let mut echo = EchoProtocol::new();
        let transport = TransportBuilder::new(TransportOptions::default())
            .spawn(local, EchoProtocol::new())
            .unwrap();

        let notice = ShutdownNotice::new(
            1001,
            "Server shutdown",
            tokio::time::Instant::now() + std::time::Duration::from_secs(1),
        );
        echo.shutdown_requested(&transport, &notice);

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(&received[..2], &[0x03, 0xE9]);
        assert_eq!(&received[2..], b"Server shutdown");
        transport.wait_closed().await;
    }
}
