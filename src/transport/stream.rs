//! Stream transport handle.
//!
//! A `Transport` is the protocol-facing half of one connection. The socket
//! itself is owned by the connection's driver task (`driver.rs`); the handle
//! only shares the pending-write queue and the state the driver publishes.
//!
//! ```text
//! producer ── write() ──▶ [pending queue] ──▶ driver ──▶ socket (TCP or TLS)
//!    ▲                        │ FlowControl        │
//!    └──── Paused / Normal ◀──┘                    └──▶ Protocol callbacks
//! ```

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;

use crate::net::connection::{ConnectionId, LifecycleState};
use crate::net::registry::{ConnectionRegistry, RegistryEntry};
use crate::net::tls::TlsSession;
use crate::observability::metrics;
use crate::transport::driver::Driver;
use crate::transport::error::TransportError;
use crate::transport::flow::{FlowControl, FlowState, Watermarks};
use crate::transport::protocol::Protocol;

/// Default socket read size (64 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Per-connection tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    pub watermarks: Watermarks,
    pub read_buffer_size: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            watermarks: Watermarks::default(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

/// A queued chunk. The bytes are never mutated; `written` tracks partial writes.
#[derive(Debug)]
pub(crate) struct WriteRequest {
    data: Bytes,
    written: usize,
    pub(crate) enqueued_at: Instant,
}

impl WriteRequest {
    fn new(data: Bytes) -> Self {
        Self {
            data,
            written: 0,
            enqueued_at: Instant::now(),
        }
    }

    /// Bytes not yet confirmed by the OS.
    pub(crate) fn remaining(&self) -> Bytes {
        self.data.slice(self.written..)
    }

    /// Record `n` confirmed bytes. Returns true once the whole chunk is sent.
    pub(crate) fn advance(&mut self, n: usize) -> bool {
        self.written = (self.written + n).min(self.data.len());
        self.written == self.data.len()
    }
}

#[derive(Debug)]
pub(crate) struct State {
    pub(crate) lifecycle: LifecycleState,
    pub(crate) queue: VecDeque<WriteRequest>,
    pub(crate) flow: FlowControl,
    /// Error that closed the connection (reset, I/O failure).
    pub(crate) terminal: Option<TransportError>,
    /// Why queued bytes were dropped without a connection error (abort, close deadline).
    pub(crate) discard_cause: Option<TransportError>,
    pub(crate) close_deadline: Option<Instant>,
    pub(crate) abort_requested: bool,
    pub(crate) reading_paused: bool,
}

pub(crate) struct Shared {
    pub(crate) id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    tls: Option<TlsSession>,
    state: Mutex<State>,
    /// Wakes the driver after a state change it must react to.
    pub(crate) wake: Notify,
    lifecycle: watch::Sender<LifecycleState>,
    flow: watch::Sender<FlowState>,
}

impl Shared {
    /// Never held across an await.
    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move the lifecycle forward and publish it while the state lock is held,
    /// so observers never see transitions out of order.
    pub(crate) fn advance_lifecycle(&self, state: &mut State, next: LifecycleState) -> bool {
        if state.lifecycle.advance(next) {
            self.lifecycle.send_replace(next);
            true
        } else {
            false
        }
    }

    pub(crate) fn publish_flow(&self, flow: FlowState) {
        self.flow.send_replace(flow);
    }
}

/// Handle to one connection. Cloning is cheap (Arc-based).
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
}

impl Transport {
    pub fn builder() -> TransportBuilder {
        TransportBuilder::new(TransportOptions::default())
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    /// Negotiated TLS parameters, when the connection is encrypted.
    pub fn tls_session(&self) -> Option<&TlsSession> {
        self.shared.tls.as_ref()
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.shared.lock().lifecycle
    }

    pub fn is_closing(&self) -> bool {
        self.lifecycle() != LifecycleState::Open
    }

    pub fn flow_state(&self) -> FlowState {
        self.shared.lock().flow.state()
    }

    /// Bytes queued but not yet confirmed by the OS.
    pub fn pending_bytes(&self) -> usize {
        self.shared.lock().flow.pending()
    }

    pub fn watermarks(&self) -> Watermarks {
        self.shared.lock().flow.watermarks()
    }

    /// Pause/resume notifications for producers outside the protocol.
    pub fn flow_updates(&self) -> watch::Receiver<FlowState> {
        self.shared.flow.subscribe()
    }

    pub fn lifecycle_updates(&self) -> watch::Receiver<LifecycleState> {
        self.shared.lifecycle.subscribe()
    }

    /// Queue `data` for transmission. Never blocks.
    ///
    /// Crossing the high watermark switches the flow state to `Paused`
    /// before this call returns; the producer must wait (see [`drain`](Self::drain))
    /// before writing more.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<(), TransportError> {
        let data = data.into();
        let mut state = self.shared.lock();
        match state.lifecycle {
            LifecycleState::Open => {}
            LifecycleState::Closing => return Err(TransportError::Closing),
            LifecycleState::Closed => {
                return Err(state.terminal.clone().unwrap_or(TransportError::Closed));
            }
        }
        if data.is_empty() {
            return Ok(());
        }

        let len = data.len();
        state.queue.push_back(WriteRequest::new(data));
        if let Some(flow) = state.flow.on_enqueue(len) {
            self.shared.publish_flow(flow);
            tracing::debug!(
                connection_id = %self.shared.id,
                pending_bytes = state.flow.pending(),
                high_watermark = state.flow.watermarks().high(),
                "Write buffer above high watermark, pausing producer"
            );
            metrics::record_backpressure(flow);
        }
        drop(state);

        self.shared.wake.notify_one();
        Ok(())
    }

    /// Wait until the producer may write again.
    ///
    /// Returns immediately while the flow state is `Normal`. Fails with the
    /// connection's terminal error if it closes while bytes are still owed:
    /// `ConnectionReset` after a reset, `OperationCancelled` after a local
    /// abort, `Timeout` after a close deadline dropped them.
    pub async fn drain(&self) -> Result<(), TransportError> {
        let mut flow = self.shared.flow.subscribe();
        let mut lifecycle = self.shared.lifecycle.subscribe();
        loop {
            {
                let state = self.shared.lock();
                if state.lifecycle.is_closed() {
                    return match state.terminal.clone().or_else(|| state.discard_cause.clone()) {
                        Some(err) => Err(err),
                        None => Ok(()),
                    };
                }
                if state.flow.state() == FlowState::Normal {
                    return Ok(());
                }
            }
            tokio::select! {
                _ = flow.changed() => {}
                _ = lifecycle.changed() => {}
            }
        }
    }

    /// Start an orderly close without waiting for it.
    ///
    /// Pending writes are flushed; if `timeout` elapses first, the rest is
    /// dropped. Without a timeout the flush waits for the OS indefinitely.
    /// Calls after the first are ignored.
    pub fn begin_close(&self, timeout: Option<Duration>) {
        let mut state = self.shared.lock();
        if state.lifecycle != LifecycleState::Open {
            return;
        }
        state.close_deadline = timeout.map(|t| Instant::now() + t);
        self.shared.advance_lifecycle(&mut state, LifecycleState::Closing);
        tracing::debug!(
            connection_id = %self.shared.id,
            pending_bytes = state.flow.pending(),
            timeout = ?timeout,
            "Closing transport"
        );
        drop(state);
        self.shared.wake.notify_one();
    }

    /// Close and wait until the connection is `Closed`. Idempotent.
    ///
    /// Dropping this future does not stop the close.
    pub async fn close(&self, timeout: Option<Duration>) {
        self.begin_close(timeout);
        self.wait_closed().await;
    }

    pub async fn wait_closed(&self) {
        let mut lifecycle = self.shared.lifecycle.subscribe();
        let _ = lifecycle.wait_for(|state| state.is_closed()).await;
    }

    /// Close immediately, discarding pending writes.
    pub fn abort(&self) {
        let mut state = self.shared.lock();
        if state.lifecycle.is_closed() {
            return;
        }
        state.abort_requested = true;
        self.shared.advance_lifecycle(&mut state, LifecycleState::Closing);
        drop(state);
        self.shared.wake.notify_one();
    }

    /// Stop reading from the socket until [`resume_reading`](Self::resume_reading).
    pub fn pause_reading(&self) {
        self.set_reading_paused(true);
    }

    pub fn resume_reading(&self) {
        self.set_reading_paused(false);
    }

    pub fn is_reading_paused(&self) -> bool {
        self.shared.lock().reading_paused
    }

    fn set_reading_paused(&self, paused: bool) {
        let mut state = self.shared.lock();
        if state.reading_paused == paused {
            return;
        }
        state.reading_paused = paused;
        drop(state);
        tracing::trace!(connection_id = %self.shared.id, paused, "Read side flow changed");
        self.shared.wake.notify_one();
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.shared.id)
            .field("peer_addr", &self.shared.peer_addr)
            .field("tls", &self.shared.tls.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder that attaches a socket and a protocol to a new driver task.
#[derive(Debug)]
pub struct TransportBuilder {
    options: TransportOptions,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    tls: Option<TlsSession>,
    registry: Option<ConnectionRegistry>,
}

impl TransportBuilder {
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options,
            peer_addr: None,
            local_addr: None,
            tls: None,
            registry: None,
        }
    }

    pub fn peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    pub fn tls_session(mut self, session: TlsSession) -> Self {
        self.tls = Some(session);
        self
    }

    /// Register the connection so shutdown can reach it.
    pub fn registry(mut self, registry: ConnectionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Take ownership of `io` and start the driver task.
    ///
    /// Must be called within a Tokio runtime. Fails with `RegistryClosed`
    /// (dropping `io`) if the registry is sealed for shutdown.
    pub fn spawn<S, P>(self, io: S, protocol: P) -> Result<Transport, TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        P: Protocol,
    {
        let id = ConnectionId::new();
        let (lifecycle, _) = watch::channel(LifecycleState::Open);
        let (flow, _) = watch::channel(FlowState::Normal);
        let shared = Arc::new(Shared {
            id,
            peer_addr: self.peer_addr,
            local_addr: self.local_addr,
            tls: self.tls,
            state: Mutex::new(State {
                lifecycle: LifecycleState::Open,
                queue: VecDeque::new(),
                flow: FlowControl::new(self.options.watermarks),
                terminal: None,
                discard_cause: None,
                close_deadline: None,
                abort_requested: false,
                reading_paused: false,
            }),
            wake: Notify::new(),
            lifecycle,
            flow,
        });

        // Without a registry the sender is dropped here and the driver
        // simply never receives control messages.
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        if let Some(registry) = &self.registry {
            let entry = RegistryEntry::new(
                id,
                self.peer_addr,
                control_tx,
                shared.lifecycle.subscribe(),
            );
            if let Err(err) = registry.register(entry) {
                tracing::debug!(connection_id = %id, "Registry sealed, refusing connection");
                return Err(err);
            }
        }

        let transport = Transport { shared };
        let driver = Driver::new(
            transport.clone(),
            io,
            protocol,
            control_rx,
            self.registry,
            self.options.read_buffer_size,
        );

        metrics::record_connection_opened();
        tracing::debug!(
            connection_id = %id,
            peer_addr = ?self.peer_addr,
            tls = transport.tls_session().is_some(),
            "Transport started"
        );

        tokio::spawn(driver.run());
        Ok(transport)
    }

    /// Open a plain TCP connection to `addr` and start a transport on it.
    pub async fn connect<P: Protocol>(
        self,
        addr: SocketAddr,
        protocol: P,
    ) -> Result<Transport, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        self.peer_addr(addr)
            .local_addr(local_addr)
            .spawn(stream, protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Records callbacks so tests can assert on their order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Seen {
        Made,
        Data(Vec<u8>),
        Eof,
        Paused,
        Resumed,
        Lost(Option<&'static str>),
    }

    struct Recorder {
        events: mpsc::UnboundedSender<Seen>,
        keep_half_open: bool,
    }

    impl Recorder {
        fn new() -> (Self, mpsc::UnboundedReceiver<Seen>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Self {
                    events: tx,
                    keep_half_open: false,
                },
                rx,
            )
        }
    }

    impl Protocol for Recorder {
        fn connection_made(&mut self, _transport: Transport) {
            let _ = self.events.send(Seen::Made);
        }
        fn data_received(&mut self, data: Bytes) {
            let _ = self.events.send(Seen::Data(data.to_vec()));
        }
        fn eof_received(&mut self) -> bool {
            let _ = self.events.send(Seen::Eof);
            self.keep_half_open
        }
        fn connection_lost(&mut self, error: Option<TransportError>) {
            let _ = self.events.send(Seen::Lost(error.map(|e| e.kind())));
        }
        fn pause_writing(&mut self) {
            let _ = self.events.send(Seen::Paused);
        }
        fn resume_writing(&mut self) {
            let _ = self.events.send(Seen::Resumed);
        }
    }

    fn small_options() -> TransportOptions {
        TransportOptions {
            watermarks: Watermarks::new(1024, 256).unwrap(),
            read_buffer_size: 512,
        }
    }

    async fn expect(rx: &mut mpsc::UnboundedReceiver<Seen>, want: Seen) {
        loop {
            let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for protocol event")
                .expect("protocol dropped");
            if got == want {
                return;
            }
        }
    }

    #[tokio::test]
    async fn writes_reach_peer_in_order() {
        let (local, mut peer) = tokio::io::duplex(64);
        let (proto, mut events) = Recorder::new();
        let transport = TransportBuilder::new(small_options()).spawn(local, proto).unwrap();
        expect(&mut events, Seen::Made).await;

        let mut expected = Vec::new();
        for i in 0..20u8 {
            let chunk = vec![i; 37];
            expected.extend_from_slice(&chunk);
            transport.write(chunk).unwrap();
            transport.drain().await.unwrap();
        }

        let mut received = vec![0u8; expected.len()];
        peer.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn pause_is_visible_before_next_write() {
        let (local, mut peer) = tokio::io::duplex(64);
        let (proto, mut events) = Recorder::new();
        let transport = TransportBuilder::new(small_options()).spawn(local, proto).unwrap();

        transport.write(vec![1u8; 1000]).unwrap();
        assert_eq!(transport.flow_state(), FlowState::Normal);
        transport.write(vec![2u8; 100]).unwrap();
        // The enqueue that crossed the high watermark already paused the producer.
        assert_eq!(transport.flow_state(), FlowState::Paused);
        expect(&mut events, Seen::Paused).await;

        let drained = tokio::spawn({
            let transport = transport.clone();
            async move { transport.drain().await }
        });

        let mut sink = vec![0u8; 1100];
        peer.read_exact(&mut sink).await.unwrap();
        drained.await.unwrap().unwrap();
        assert!(transport.pending_bytes() <= 256);
        expect(&mut events, Seen::Resumed).await;
    }

    #[tokio::test]
    async fn peer_data_and_eof_are_delivered_once() {
        let (local, mut peer) = tokio::io::duplex(1024);
        let (proto, mut events) = Recorder::new();
        let transport = TransportBuilder::new(small_options()).spawn(local, proto).unwrap();

        peer.write_all(b"hello").await.unwrap();
        expect(&mut events, Seen::Data(b"hello".to_vec())).await;
        peer.shutdown().await.unwrap();
        expect(&mut events, Seen::Eof).await;
        expect(&mut events, Seen::Lost(None)).await;

        transport.wait_closed().await;
        assert_eq!(transport.lifecycle(), LifecycleState::Closed);
        assert!(matches!(transport.write("late"), Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn dropped_peer_resets_pending_writes() {
        let (local, peer) = tokio::io::duplex(64);
        let (proto, mut events) = Recorder::new();
        let transport = TransportBuilder::new(small_options()).spawn(local, proto).unwrap();

        transport.write(vec![7u8; 4096]).unwrap();
        drop(peer);

        let err = transport.drain().await.unwrap_err();
        assert!(err.is_reset(), "expected reset, got {:?}", err);
        expect(&mut events, Seen::Lost(Some("reset"))).await;
        assert_eq!(transport.pending_bytes(), 0);
        assert!(transport.write("again").unwrap_err().is_reset());
    }

    #[tokio::test]
    async fn close_flushes_then_closes_and_is_idempotent() {
        let (local, mut peer) = tokio::io::duplex(16);
        let (proto, _events) = Recorder::new();
        let transport = TransportBuilder::new(small_options()).spawn(local, proto).unwrap();

        transport.write(vec![9u8; 300]).unwrap();
        let reader = tokio::spawn(async move {
            let mut all = Vec::new();
            peer.read_to_end(&mut all).await.unwrap();
            all
        });

        transport.close(None).await;
        transport.close(None).await;
        assert_eq!(transport.lifecycle(), LifecycleState::Closed);
        assert!(matches!(transport.write("x"), Err(TransportError::Closed)));
        assert_eq!(reader.await.unwrap(), vec![9u8; 300]);
    }

    #[tokio::test]
    async fn close_deadline_drops_unsent_bytes() {
        let (local, _peer) = tokio::io::duplex(16);
        let (proto, mut events) = Recorder::new();
        let transport = TransportBuilder::new(small_options()).spawn(local, proto).unwrap();

        transport.write(vec![1u8; 2000]).unwrap();
        let started = Instant::now();
        transport.close(Some(Duration::from_millis(50))).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        expect(&mut events, Seen::Lost(Some("timeout"))).await;
        assert!(matches!(transport.drain().await, Err(TransportError::Timeout)));
    }

    #[tokio::test]
    async fn abort_cancels_waiting_producer() {
        let (local, _peer) = tokio::io::duplex(16);
        let (proto, mut events) = Recorder::new();
        let transport = TransportBuilder::new(small_options()).spawn(local, proto).unwrap();

        transport.write(vec![1u8; 5000]).unwrap();
        let waiter = tokio::spawn({
            let transport = transport.clone();
            async move { transport.drain().await }
        });
        tokio::task::yield_now().await;
        transport.abort();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(TransportError::OperationCancelled)));
        expect(&mut events, Seen::Lost(None)).await;
        assert_eq!(transport.lifecycle(), LifecycleState::Closed);
    }

    #[tokio::test]
    async fn half_open_keeps_writing_after_eof() {
        let (local, mut peer) = tokio::io::duplex(1024);
        let (mut proto, mut events) = Recorder::new();
        proto.keep_half_open = true;
        let transport = TransportBuilder::new(small_options()).spawn(local, proto).unwrap();

        peer.shutdown().await.unwrap();
        expect(&mut events, Seen::Eof).await;
        assert_eq!(transport.lifecycle(), LifecycleState::Open);

        transport.write("still here").unwrap();
        let mut buf = [0u8; 10];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");
    }

    #[tokio::test]
    async fn paused_reading_stops_delivery() {
        struct Counter(Arc<AtomicUsize>);
        impl Protocol for Counter {
            fn data_received(&mut self, data: Bytes) {
                self.0.fetch_add(data.len(), Ordering::SeqCst);
            }
        }

        let (local, mut peer) = tokio::io::duplex(1024);
        let seen = Arc::new(AtomicUsize::new(0));
        let transport = TransportBuilder::new(small_options())
            .spawn(local, Counter(seen.clone()))
            .unwrap();

        transport.pause_reading();
        tokio::task::yield_now().await;
        peer.write_all(b"queued").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        transport.resume_reading();
        tokio::time::timeout(Duration::from_secs(2), async {
            while seen.load(Ordering::SeqCst) < 6 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn registered_transport_leaves_registry_when_closed() {
        let registry = ConnectionRegistry::new();
        let (local, _peer) = tokio::io::duplex(64);
        let (proto, _events) = Recorder::new();
        let transport = TransportBuilder::new(small_options())
            .registry(registry.clone())
            .spawn(local, proto)
            .unwrap();

        assert!(registry.contains(transport.id()));
        transport.close(None).await;
        assert!(!registry.contains(transport.id()));
    }

    /// Stream whose write-side shutdown never completes, like a TLS
    /// `close_notify` stuck behind a peer that stopped reading.
    struct StuckShutdown(tokio::io::DuplexStream);

    impl AsyncRead for StuckShutdown {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for StuckShutdown {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::pin::Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Pending
        }
    }

    #[tokio::test]
    async fn abort_interrupts_stalled_write_shutdown() {
        let registry = ConnectionRegistry::new();
        let (local, _peer) = tokio::io::duplex(64);
        let (proto, mut events) = Recorder::new();
        let transport = TransportBuilder::new(small_options())
            .registry(registry.clone())
            .spawn(StuckShutdown(local), proto)
            .unwrap();

        transport.begin_close(None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.lifecycle(), LifecycleState::Closing);
        assert!(registry.contains(transport.id()));

        transport.abort();
        tokio::time::timeout(Duration::from_secs(1), transport.wait_closed())
            .await
            .expect("abort did not close the transport");
        assert_eq!(transport.lifecycle(), LifecycleState::Closed);
        assert!(!registry.contains(transport.id()));
        expect(&mut events, Seen::Lost(None)).await;
    }

    #[tokio::test]
    async fn registry_abort_interrupts_stalled_write_shutdown() {
        let registry = ConnectionRegistry::new();
        let (local, _peer) = tokio::io::duplex(64);
        let (proto, _events) = Recorder::new();
        let transport = TransportBuilder::new(small_options())
            .registry(registry.clone())
            .spawn(StuckShutdown(local), proto)
            .unwrap();

        transport.begin_close(None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let entry = registry
            .snapshot()
            .into_iter()
            .find(|entry| entry.id() == transport.id())
            .unwrap();
        assert!(entry.abort());

        tokio::time::timeout(Duration::from_secs(1), transport.wait_closed())
            .await
            .expect("control abort did not close the transport");
    }

    #[tokio::test]
    async fn sealed_registry_refuses_transport() {
        let registry = ConnectionRegistry::new();
        registry.seal();
        let (local, _peer) = tokio::io::duplex(64);
        let (proto, _events) = Recorder::new();
        let result = TransportBuilder::new(small_options())
            .registry(registry)
            .spawn(local, proto);
        assert!(matches!(result, Err(TransportError::RegistryClosed)));
    }
}
