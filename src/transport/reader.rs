//! Pull-style adapter over the callback `Protocol`.
//!
//! Code that prefers `read().await` loops over callbacks attaches a
//! [`ChannelProtocol`] to the transport and consumes a [`StreamReader`].
//! Inbound bytes are forwarded over a channel; once more than `limit` bytes
//! sit unread the transport stops reading the socket, and it resumes when the
//! consumer has caught up to half of that.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::transport::error::TransportError;
use crate::transport::protocol::{Protocol, ShutdownNotice};
use crate::transport::stream::Transport;

/// Default unread-bytes limit before the transport stops reading.
pub const DEFAULT_READ_LIMIT: usize = 256 * 1024;

enum Event {
    Made(Transport),
    Data(Bytes),
    Eof,
    Shutdown(ShutdownNotice),
    Lost(Option<TransportError>),
}

/// What [`StreamReader::next`] yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Data(Bytes),
    /// The server is shutting down; the consumer decides how to close.
    Shutdown(ShutdownNotice),
}

/// Protocol half: forwards every callback to the paired reader.
pub struct ChannelProtocol {
    events: mpsc::UnboundedSender<Event>,
    transport: Option<Transport>,
    buffered: Arc<AtomicUsize>,
    limit: usize,
}

/// Consumer half.
pub struct StreamReader {
    events: mpsc::UnboundedReceiver<Event>,
    transport: Option<Transport>,
    buffered: Arc<AtomicUsize>,
    limit: usize,
    shutdown: Option<ShutdownNotice>,
    error: Option<TransportError>,
    finished: bool,
}

/// Create a connected protocol/reader pair.
pub fn channel(limit: usize) -> (ChannelProtocol, StreamReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    let buffered = Arc::new(AtomicUsize::new(0));
    let limit = limit.max(1);
    (
        ChannelProtocol {
            events: tx,
            transport: None,
            buffered: buffered.clone(),
            limit,
        },
        StreamReader {
            events: rx,
            transport: None,
            buffered,
            limit,
            shutdown: None,
            error: None,
            finished: false,
        },
    )
}

impl Protocol for ChannelProtocol {
    fn connection_made(&mut self, transport: Transport) {
        self.transport = Some(transport.clone());
        let _ = self.events.send(Event::Made(transport));
    }

    fn data_received(&mut self, data: Bytes) {
        let buffered = self.buffered.fetch_add(data.len(), Ordering::SeqCst) + data.len();
        let _ = self.events.send(Event::Data(data));
        if buffered > self.limit {
            if let Some(transport) = &self.transport {
                transport.pause_reading();
            }
        }
    }

    fn eof_received(&mut self) -> bool {
        let _ = self.events.send(Event::Eof);
        // Keep the write side open; the consumer closes when it is done.
        true
    }

    fn connection_lost(&mut self, error: Option<TransportError>) {
        let _ = self.events.send(Event::Lost(error));
        self.transport = None;
    }

    fn shutdown_requested(&mut self, _transport: &Transport, notice: &ShutdownNotice) {
        let _ = self.events.send(Event::Shutdown(notice.clone()));
    }
}

impl StreamReader {
    /// Next chunk of data or shutdown notice.
    ///
    /// `Ok(None)` means the peer finished sending or the transport closed
    /// cleanly. A connection error is repeated on every later call.
    pub async fn next(&mut self) -> Result<Option<Inbound>, TransportError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.finished {
            return Ok(None);
        }

        loop {
            let event = match self.events.recv().await {
                Some(event) => event,
                None => {
                    self.finished = true;
                    return Ok(None);
                }
            };
            match event {
                Event::Made(transport) => self.transport = Some(transport),
                Event::Data(data) => {
                    self.consumed(data.len());
                    return Ok(Some(Inbound::Data(data)));
                }
                Event::Shutdown(notice) => {
                    self.shutdown = Some(notice.clone());
                    return Ok(Some(Inbound::Shutdown(notice)));
                }
                // The write side stays usable after EOF, so a later call
                // may still report how the connection ended.
                Event::Eof => return Ok(None),
                Event::Lost(None) => {
                    self.finished = true;
                    return Ok(None);
                }
                Event::Lost(Some(err)) => {
                    self.error = Some(err.clone());
                    return Err(err);
                }
            }
        }
    }

    /// Next chunk of data, skipping (but remembering) shutdown notices.
    pub async fn read(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            match self.next().await? {
                Some(Inbound::Data(data)) => return Ok(Some(data)),
                Some(Inbound::Shutdown(_)) => continue,
                None => return Ok(None),
            }
        }
    }

    /// Read until end of stream.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Read until at least `n` bytes have arrived (the last chunk is not split).
    /// Fails with `ConnectionReset` if the stream ends first.
    pub async fn read_exact(&mut self, n: usize) -> Result<Bytes, TransportError> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            match self.read().await? {
                Some(chunk) => out.extend_from_slice(&chunk),
                None => return Err(TransportError::ConnectionReset),
            }
        }
        Ok(Bytes::from(out))
    }

    /// The transport this reader is attached to, once the connection is up.
    pub fn transport(&self) -> Option<&Transport> {
        self.transport.as_ref()
    }

    /// The last shutdown notice seen, if any.
    pub fn shutdown_notice(&self) -> Option<&ShutdownNotice> {
        self.shutdown.as_ref()
    }

    /// Bytes received from the socket but not yet returned by `read`.
    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn consumed(&mut self, n: usize) {
        let remaining = self.buffered.fetch_sub(n, Ordering::SeqCst) - n;
        if remaining <= self.limit / 2 {
            if let Some(transport) = &self.transport {
                if transport.is_reading_paused() {
                    transport.resume_reading();
                }
            }
        }
    }
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("buffered", &self.buffered())
            .field("limit", &self.limit)
            .field("finished", &self.finished)
            .field("error", &self.error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::flow::Watermarks;
    use crate::transport::stream::{TransportBuilder, TransportOptions};
    use tokio::io::AsyncWriteExt;

    fn options() -> TransportOptions {
        TransportOptions {
            watermarks: Watermarks::new(1024, 256).unwrap(),
            read_buffer_size: 64,
        }
    }

    #[tokio::test]
    async fn reads_data_then_end_of_stream() {
        let (local, mut peer) = tokio::io::duplex(1024);
        let (protocol, mut reader) = channel(DEFAULT_READ_LIMIT);
        let transport = TransportBuilder::new(options()).spawn(local, protocol).unwrap();

        peer.write_all(b"hello world").await.unwrap();
        peer.shutdown().await.unwrap();
        assert_eq!(reader.read_to_end().await.unwrap(), b"hello world");

        transport.close(None).await;
        assert_eq!(reader.read().await.unwrap(), None);
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn reset_error_is_sticky() {
        let (local, peer) = tokio::io::duplex(16);
        let (protocol, mut reader) = channel(DEFAULT_READ_LIMIT);
        let transport = TransportBuilder::new(options()).spawn(local, protocol).unwrap();

        transport.write(vec![0u8; 4096]).unwrap();
        drop(peer);

        // EOF may be observed before the failed write; keep reading until the error.
        let first = loop {
            match reader.next().await {
                Err(err) => break err,
                Ok(_) => continue,
            }
        };
        assert!(first.is_reset());
        assert!(reader.read().await.unwrap_err().is_reset());
    }

    #[tokio::test]
    async fn slow_consumer_pauses_socket_reads() {
        let (local, mut peer) = tokio::io::duplex(64);
        let (protocol, mut reader) = channel(128);
        let transport = TransportBuilder::new(options()).spawn(local, protocol).unwrap();

        let payload = vec![5u8; 4096];
        let writer = tokio::spawn({
            let payload = payload.clone();
            async move {
                peer.write_all(&payload).await.unwrap();
                peer
            }
        });

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while !transport.is_reading_paused() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(reader.buffered() > 128);

        let got = reader.read_exact(payload.len()).await.unwrap();
        assert_eq!(got.len(), payload.len());
        drop(writer.await.unwrap());
    }
}
