//! Connection identity and lifecycle state machine.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing and registry lookup
//! - Define the monotonic lifecycle (Open → Closing → Closed)

use std::sync::atomic::{AtomicU64, Ordering};

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    /// Reading and writing.
    Open,
    /// Close requested; flushing pending writes, no new writes accepted.
    Closing,
    /// Socket released. Terminal.
    Closed,
}

impl LifecycleState {
    /// Move to `next` if it is later in the lifecycle. Returns true if the state changed.
    pub fn advance(&mut self, next: LifecycleState) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }

    pub fn is_closed(&self) -> bool {
        *self == LifecycleState::Closed
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Open => "open",
            LifecycleState::Closing => "closing",
            LifecycleState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
