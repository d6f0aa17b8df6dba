//! Process-wide registry of live connections.
//!
//! # Responsibilities
//! - Track every transport that is `Open` or `Closing`
//! - Give the shutdown coordinator a snapshot to notify and force-close
//! - Refuse new registrations once shutdown has begun (sealing)
//!
//! # Design Decisions
//! - Entries never own the socket: they hold the connection id, a control
//!   channel into the transport's driver task and a lifecycle watch
//! - The transport removes its own entry when it reaches `Closed`; protocol
//!   code never deregisters
//! - Iteration always works on a snapshot, so removal needs no coordination
//!   with a shutdown in progress

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};

use crate::net::connection::{ConnectionId, LifecycleState};
use crate::transport::error::TransportError;
use crate::transport::protocol::ShutdownNotice;

/// Message delivered to a transport's driver task from outside the connection.
#[derive(Debug, Clone)]
pub enum ControlMessage {
    /// Forward a shutdown notice to the protocol.
    Shutdown(ShutdownNotice),
    /// Force-close now, discarding pending writes.
    Abort,
}

/// Non-owning handle to one registered connection.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    control: mpsc::UnboundedSender<ControlMessage>,
    lifecycle: watch::Receiver<LifecycleState>,
}

impl RegistryEntry {
    pub(crate) fn new(
        id: ConnectionId,
        peer_addr: Option<SocketAddr>,
        control: mpsc::UnboundedSender<ControlMessage>,
        lifecycle: watch::Receiver<LifecycleState>,
    ) -> Self {
        Self {
            id,
            peer_addr,
            control,
            lifecycle,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn lifecycle(&self) -> LifecycleState {
        *self.lifecycle.borrow()
    }

    /// Queue a shutdown notice for the connection. Never blocks.
    /// Returns false if the transport task has already finished.
    pub fn notify_shutdown(&self, notice: ShutdownNotice) -> bool {
        self.control.send(ControlMessage::Shutdown(notice)).is_ok()
    }

    /// Ask the transport to force-close. Never blocks.
    pub fn abort(&self) -> bool {
        self.control.send(ControlMessage::Abort).is_ok()
    }

    /// Wait until the connection reports `Closed`.
    pub async fn wait_closed(&self) {
        let mut lifecycle = self.lifecycle.clone();
        // A dropped sender means the transport is gone, which is closed too.
        let _ = lifecycle.wait_for(|state| state.is_closed()).await;
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    entries: DashMap<ConnectionId, RegistryEntry>,
    sealed: AtomicBool,
}

/// Shared set of live connections. Cloning is cheap (Arc-based).
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Registering the same id twice keeps one entry.
    pub fn register(&self, entry: RegistryEntry) -> Result<(), TransportError> {
        if self.is_sealed() {
            return Err(TransportError::RegistryClosed);
        }
        let id = entry.id;
        self.inner.entries.insert(id, entry);
        // Re-check after inserting: a concurrent `seal` either sees this
        // entry in its snapshot or we see the seal and back out.
        if self.is_sealed() {
            self.inner.entries.remove(&id);
            return Err(TransportError::RegistryClosed);
        }
        tracing::trace!(connection_id = %id, "Connection registered");
        Ok(())
    }

    /// Remove a connection. Returns true if it was present.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let removed = self.inner.entries.remove(&id).is_some();
        if removed {
            tracing::trace!(connection_id = %id, "Connection deregistered");
        }
        removed
    }

    /// Stop accepting registrations.
    pub fn seal(&self) {
        self.inner.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.sealed.load(Ordering::SeqCst)
    }

    /// Point-in-time copy of the live entries, ordered by connection id.
    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<RegistryEntry> = self
            .inner
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by_key(|entry| entry.id);
        entries
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }
}
