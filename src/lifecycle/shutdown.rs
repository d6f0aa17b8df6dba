//! Shutdown coordination.
//!
//! # State Transitions
//! ```text
//! Idle → Draining:         shutdown requested; registry sealed, notices sent
//! Draining → ForceClosing: every connection closed, or the grace period
//!                          expired, whichever came first
//! ForceClosing → Done:     stragglers aborted, registry entries released
//! ```
//!
//! # Design Decisions
//! - The shutdown sequence runs in its own task: a caller that stops
//!   waiting does not stop the shutdown
//! - Notices are fire-and-forget; one slow connection never delays the
//!   notice to another
//! - Every snapshotted entry is released before `Done`, so the registry is
//!   empty once the phase reaches `Done`
//! - Phase changes go out on a `watch` (latest phase) and a `broadcast`
//!   (every transition, for observers that must not miss one)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};

use crate::config::ShutdownConfig;
use crate::net::connection::ConnectionId;
use crate::net::registry::ConnectionRegistry;
use crate::observability::metrics;
use crate::transport::protocol::ShutdownNotice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownPhase {
    Idle,
    Draining,
    ForceClosing,
    Done,
}

/// How a connection left during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Closed on its own before the deadline.
    Drained,
    /// Still open at the deadline and force-closed.
    Aborted,
}

/// Summary of a completed shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub drained: usize,
    pub aborted: usize,
    pub elapsed: Duration,
    pub deadline_hit: bool,
    /// Per-connection outcome, ordered by connection id.
    pub outcomes: Vec<(ConnectionId, SessionOutcome)>,
}

struct Inner {
    registry: ConnectionRegistry,
    config: ShutdownConfig,
    started: AtomicBool,
    phase: watch::Sender<ShutdownPhase>,
    transitions: broadcast::Sender<ShutdownPhase>,
    report: watch::Sender<Option<ShutdownReport>>,
}

/// Coordinator for graceful shutdown. Cloning is cheap (Arc-based).
///
/// Long-running tasks (the accept loop) subscribe to the phase and stop
/// once it leaves `Idle`.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl ShutdownCoordinator {
    pub fn new(registry: ConnectionRegistry, config: ShutdownConfig) -> Self {
        let (phase, _) = watch::channel(ShutdownPhase::Idle);
        let (report, _) = watch::channel(None);
        let (transitions, _) = broadcast::channel(4);
        Self {
            inner: Arc::new(Inner {
                registry,
                config,
                started: AtomicBool::new(false),
                phase,
                transitions,
                report,
            }),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.inner.phase.borrow()
    }

    /// Subscribe to phase changes.
    pub fn subscribe(&self) -> watch::Receiver<ShutdownPhase> {
        self.inner.phase.subscribe()
    }

    /// Receive every phase transition from now on, in order.
    pub fn transitions(&self) -> broadcast::Receiver<ShutdownPhase> {
        self.inner.transitions.subscribe()
    }

    /// Start the shutdown sequence without waiting for it.
    /// Returns false if it was already started.
    pub fn trigger(&self) -> bool {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        tokio::spawn(run(self.inner.clone()));
        true
    }

    /// Shut down and wait for the report. Idempotent: concurrent and later
    /// callers share the first run and receive the same report.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.trigger();
        self.wait_done().await
    }

    /// Wait until a shutdown (started by anyone) reaches `Done`.
    pub async fn wait_done(&self) -> ShutdownReport {
        let mut report = self.inner.report.subscribe();
        let done = match report.wait_for(Option::is_some).await {
            Ok(done) => done.clone().unwrap_or_default(),
            Err(_) => ShutdownReport::default(),
        };
        done
    }
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("phase", &self.phase())
            .field("connections", &self.inner.registry.len())
            .finish()
    }
}

async fn run(inner: Arc<Inner>) {
    let started = Instant::now();
    let grace = inner.config.grace_period();
    let deadline = started + grace;

    inner.registry.seal();
    inner.advance(ShutdownPhase::Draining);

    let snapshot = inner.registry.snapshot();
    tracing::info!(
        connections = snapshot.len(),
        grace_period = ?grace,
        "Graceful shutdown started"
    );

    let notice = ShutdownNotice::new(
        inner.config.close_status,
        inner.config.close_reason.clone(),
        deadline,
    );
    for entry in &snapshot {
        if !entry.notify_shutdown(notice.clone()) {
            tracing::trace!(connection_id = %entry.id(), "Connection finished before notice");
        }
    }

    let ids: Vec<_> = snapshot.iter().map(|entry| entry.id()).collect();
    let mut waits = JoinSet::new();
    for entry in snapshot {
        waits.spawn(async move {
            let drained = timeout_at(deadline, entry.wait_closed()).await.is_ok();
            (entry, drained)
        });
    }

    let mut outcomes = Vec::new();
    let mut stragglers = Vec::new();
    while let Some(joined) = waits.join_next().await {
        match joined {
            Ok((entry, true)) => outcomes.push((entry.id(), SessionOutcome::Drained)),
            Ok((entry, false)) => stragglers.push(entry),
            Err(err) => tracing::error!(error = %err, "Shutdown wait task failed"),
        }
    }

    let deadline_hit = !stragglers.is_empty();
    inner.advance(ShutdownPhase::ForceClosing);
    if deadline_hit {
        tracing::warn!(
            connections = stragglers.len(),
            "Grace period expired, aborting remaining connections"
        );
    }
    for entry in stragglers {
        entry.abort();
        outcomes.push((entry.id(), SessionOutcome::Aborted));
    }
    for id in ids {
        inner.registry.remove(id);
    }

    outcomes.sort_by_key(|(id, _)| *id);
    let drained = outcomes
        .iter()
        .filter(|(_, outcome)| *outcome == SessionOutcome::Drained)
        .count();
    let report = ShutdownReport {
        drained,
        aborted: outcomes.len() - drained,
        elapsed: started.elapsed(),
        deadline_hit,
        outcomes,
    };

    metrics::record_shutdown(report.elapsed, report.drained, report.aborted);
    tracing::info!(
        drained = report.drained,
        aborted = report.aborted,
        elapsed = ?report.elapsed,
        "Graceful shutdown complete"
    );

    inner.advance(ShutdownPhase::Done);
    inner.report.send_replace(Some(report));
}

impl Inner {
    fn advance(&self, phase: ShutdownPhase) {
        self.phase.send_replace(phase);
        // No subscribers is fine.
        let _ = self.transitions.send(phase);
        tracing::debug!(phase = ?phase, "Shutdown phase changed");
    }
}
