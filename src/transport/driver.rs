//! Per-connection driver task.
//!
//! # Responsibilities
//! - Own the socket: the only code that reads from or writes to it
//! - Move queued writes to the OS in FIFO order and settle flow control
//! - Deliver protocol callbacks, one at a time, in event order
//! - React to control messages (shutdown notice, forced abort)
//! - Perform the single transition to `Closed` and report it exactly once
//!
//! # Design Decisions
//! - One task per connection; `Transport` handles only touch shared state
//!   and wake the task, so there is a single writer to the socket
//! - Every branch of the select loop is cancel-safe: `read_buf` and
//!   `write` report exactly the bytes they moved when they complete
//! - The registry entry is removed before `Closed` is published
//! - A forced abort also interrupts the final write-side shutdown, which
//!   may otherwise wait on a peer that stopped reading

use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::net::connection::LifecycleState;
use crate::net::registry::{ConnectionRegistry, ControlMessage};
use crate::observability::metrics;
use crate::transport::error::TransportError;
use crate::transport::flow::FlowState;
use crate::transport::protocol::Protocol;
use crate::transport::stream::{Shared, Transport};

/// How the event loop ended.
#[derive(Debug)]
enum Outcome {
    /// Close requested and every pending byte reached the OS.
    Clean,
    /// Local forced close.
    Aborted,
    /// Close deadline expired with bytes still pending.
    TimedOut,
    /// Peer reset or I/O failure.
    Failed(TransportError),
}

enum Push {
    Wrote(usize),
    Flushed,
}

enum Event {
    Control(Option<ControlMessage>),
    DeadlineExpired,
    Wake,
    Pushed(io::Result<Push>),
    Read(io::Result<usize>),
}

/// What the loop may wait on this iteration, sampled under the state lock.
struct Plan {
    chunk: Option<Bytes>,
    deadline: Option<Instant>,
    reading: bool,
}

pub(crate) struct Driver<S, P> {
    transport: Transport,
    shared: Arc<Shared>,
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    protocol: P,
    control: mpsc::UnboundedReceiver<ControlMessage>,
    control_open: bool,
    registry: Option<ConnectionRegistry>,
    read_buf: BytesMut,
    read_buffer_size: usize,
    read_closed: bool,
    needs_flush: bool,
    delivered_flow: FlowState,
}

impl<S, P> Driver<S, P>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    P: Protocol,
{
    pub(crate) fn new(
        transport: Transport,
        io: S,
        protocol: P,
        control: mpsc::UnboundedReceiver<ControlMessage>,
        registry: Option<ConnectionRegistry>,
        read_buffer_size: usize,
    ) -> Self {
        let (reader, writer) = tokio::io::split(io);
        let shared = transport.shared().clone();
        Self {
            transport,
            shared,
            reader,
            writer,
            protocol,
            control,
            control_open: true,
            registry,
            read_buf: BytesMut::with_capacity(read_buffer_size),
            read_buffer_size,
            read_closed: false,
            needs_flush: false,
            delivered_flow: FlowState::Normal,
        }
    }

    pub(crate) async fn run(mut self) {
        self.protocol.connection_made(self.transport.clone());

        let outcome = loop {
            self.deliver_flow();

            let plan = match self.plan() {
                Ok(plan) => plan,
                Err(outcome) => break outcome,
            };
            if plan.reading {
                self.read_buf.reserve(self.read_buffer_size);
            }

            let event = tokio::select! {
                msg = self.control.recv(), if self.control_open => Event::Control(msg),
                _ = sleep_until(plan.deadline.unwrap_or_else(Instant::now)), if plan.deadline.is_some() => {
                    Event::DeadlineExpired
                }
                res = push(&mut self.writer, plan.chunk.as_ref()), if plan.chunk.is_some() || self.needs_flush => {
                    Event::Pushed(res)
                }
                res = self.reader.read_buf(&mut self.read_buf), if plan.reading => Event::Read(res),
                _ = self.shared.wake.notified() => Event::Wake,
            };

            if let Some(outcome) = self.handle(event) {
                break outcome;
            }
        };

        self.finish(outcome).await;
    }

    /// Decide what to wait on, or end the loop.
    fn plan(&self) -> Result<Plan, Outcome> {
        let state = self.shared.lock();
        if state.abort_requested {
            return Err(Outcome::Aborted);
        }

        let chunk = state.queue.front().map(|req| req.remaining());
        let closing = state.lifecycle == LifecycleState::Closing;
        if closing && chunk.is_none() && !self.needs_flush {
            return Err(Outcome::Clean);
        }

        Ok(Plan {
            chunk,
            deadline: if closing { state.close_deadline } else { None },
            reading: state.lifecycle == LifecycleState::Open
                && !self.read_closed
                && !state.reading_paused,
        })
    }

    /// Tell the protocol about flow transitions it has not seen yet.
    /// Transitions that cancel out between two iterations are coalesced.
    fn deliver_flow(&mut self) {
        let current = self.shared.lock().flow.state();
        if current == self.delivered_flow {
            return;
        }
        self.delivered_flow = current;
        match current {
            FlowState::Paused => self.protocol.pause_writing(),
            FlowState::Normal => self.protocol.resume_writing(),
        }
    }

    fn handle(&mut self, event: Event) -> Option<Outcome> {
        match event {
            Event::Control(Some(ControlMessage::Shutdown(notice))) => {
                tracing::debug!(
                    connection_id = %self.shared.id,
                    status = notice.status(),
                    remaining = ?notice.remaining(),
                    "Shutdown notice delivered"
                );
                self.protocol.shutdown_requested(&self.transport, &notice);
                None
            }
            Event::Control(Some(ControlMessage::Abort)) => Some(Outcome::Aborted),
            Event::Control(None) => {
                self.control_open = false;
                None
            }
            Event::DeadlineExpired => Some(Outcome::TimedOut),
            Event::Wake => None,
            Event::Pushed(Ok(Push::Wrote(0))) => Some(Outcome::Failed(TransportError::from(
                io::Error::from(io::ErrorKind::WriteZero),
            ))),
            Event::Pushed(Ok(Push::Wrote(n))) => {
                self.on_written(n);
                None
            }
            Event::Pushed(Ok(Push::Flushed)) => {
                self.needs_flush = false;
                None
            }
            Event::Pushed(Err(err)) | Event::Read(Err(err)) => Some(Outcome::Failed(err.into())),
            Event::Read(Ok(0)) => {
                self.read_closed = true;
                tracing::debug!(connection_id = %self.shared.id, "Peer closed its write side");
                if !self.protocol.eof_received() {
                    self.transport.begin_close(None);
                }
                None
            }
            Event::Read(Ok(n)) => {
                metrics::record_bytes_received(n);
                let data = self.read_buf.split().freeze();
                self.protocol.data_received(data);
                None
            }
        }
    }

    fn on_written(&mut self, n: usize) {
        self.needs_flush = true;
        metrics::record_bytes_sent(n);

        let mut state = self.shared.lock();
        let finished = match state.queue.front_mut() {
            Some(front) => front.advance(n),
            // Queue discarded while the write was in flight.
            None => return,
        };
        if finished {
            if let Some(req) = state.queue.pop_front() {
                metrics::record_write_flushed(req.enqueued_at);
            }
        }
        if let Some(flow) = state.flow.on_sent(n) {
            self.shared.publish_flow(flow);
            tracing::debug!(
                connection_id = %self.shared.id,
                pending_bytes = state.flow.pending(),
                low_watermark = state.flow.watermarks().low(),
                "Write buffer drained to low watermark, resuming producer"
            );
            metrics::record_backpressure(flow);
        }
    }

    /// Send FIN (and `close_notify` over TLS). Bounded by the close deadline
    /// when there is one; a forced abort interrupts it at any time.
    async fn shutdown_write(&mut self) -> Outcome {
        let deadline = self.shared.lock().close_deadline;
        let shutdown = self.writer.shutdown();
        tokio::pin!(shutdown);

        loop {
            if self.shared.lock().abort_requested {
                return Outcome::Aborted;
            }

            tokio::select! {
                result = &mut shutdown => {
                    if let Err(err) = result {
                        tracing::debug!(connection_id = %self.shared.id, error = %err, "Write-side shutdown failed");
                    }
                    return Outcome::Clean;
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    tracing::debug!(connection_id = %self.shared.id, "Write-side shutdown timed out");
                    return Outcome::Clean;
                }
                msg = self.control.recv(), if self.control_open => match msg {
                    Some(ControlMessage::Abort) => return Outcome::Aborted,
                    // Already closing.
                    Some(ControlMessage::Shutdown(_)) => {}
                    None => self.control_open = false,
                },
                _ = self.shared.wake.notified() => {}
            }
        }
    }

    async fn finish(mut self, outcome: Outcome) {
        let outcome = match outcome {
            Outcome::Clean => self.shutdown_write().await,
            other => other,
        };

        if let Some(registry) = &self.registry {
            registry.remove(self.shared.id);
        }

        let (lost, label, dropped) = {
            let mut state = self.shared.lock();
            let was_paused = state.flow.state() == FlowState::Paused;
            let dropped = state.flow.discard();
            state.queue.clear();

            let (lost, label) = match &outcome {
                Outcome::Clean => (None, "clean"),
                Outcome::Aborted => {
                    if dropped > 0 {
                        state.discard_cause = Some(TransportError::OperationCancelled);
                    }
                    (None, "aborted")
                }
                Outcome::TimedOut => {
                    state.discard_cause = Some(TransportError::Timeout);
                    (Some(TransportError::Timeout), "timeout")
                }
                Outcome::Failed(err) => {
                    state.terminal = Some(err.clone());
                    (Some(err.clone()), err.kind())
                }
            };

            self.shared.advance_lifecycle(&mut state, LifecycleState::Closed);
            if was_paused {
                self.shared.publish_flow(FlowState::Normal);
            }
            (lost, label, dropped)
        };

        match &outcome {
            Outcome::Failed(err) => tracing::warn!(
                connection_id = %self.shared.id,
                error = %err,
                dropped_bytes = dropped,
                "Connection lost"
            ),
            Outcome::TimedOut => tracing::warn!(
                connection_id = %self.shared.id,
                dropped_bytes = dropped,
                "Close deadline expired, pending writes dropped"
            ),
            Outcome::Aborted => tracing::debug!(
                connection_id = %self.shared.id,
                dropped_bytes = dropped,
                "Transport aborted"
            ),
            Outcome::Clean => tracing::debug!(connection_id = %self.shared.id, "Transport closed"),
        }

        metrics::record_connection_closed(label);
        self.protocol.connection_lost(lost);
    }
}

/// Write the front chunk, or flush once the queue is empty.
async fn push<W>(writer: &mut W, chunk: Option<&Bytes>) -> io::Result<Push>
where
    W: AsyncWrite + Unpin,
{
    match chunk {
        Some(chunk) => writer.write(chunk).await.map(Push::Wrote),
        None => writer.flush().await.map(|()| Push::Flushed),
    }
}
