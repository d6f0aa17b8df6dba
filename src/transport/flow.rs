//! Write-side flow control.
//!
//! # State Transitions
//! ```text
//! Normal → Paused: pending bytes > high after an enqueue
//! Paused → Normal: pending bytes <= low after the OS confirms a write
//! ```
//!
//! Exactly one signal is produced per transition; enqueues that stay above
//! `high` while already paused produce nothing.

use thiserror::Error;

/// Default high watermark (64 KiB).
pub const DEFAULT_HIGH_WATERMARK: usize = 64 * 1024;

/// Default low watermark (16 KiB).
pub const DEFAULT_LOW_WATERMARK: usize = DEFAULT_HIGH_WATERMARK / 4;

/// Producer-facing flow state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Producer may keep writing.
    Normal,
    /// Producer must suspend writes until `Normal` is signalled again.
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("low watermark ({low}) must be below high watermark ({high})")]
pub struct WatermarkError {
    pub high: usize,
    pub low: usize,
}

/// Pause/resume byte thresholds. Invariant: `low < high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    high: usize,
    low: usize,
}

impl Watermarks {
    pub fn new(high: usize, low: usize) -> Result<Self, WatermarkError> {
        if low >= high {
            return Err(WatermarkError { high, low });
        }
        Ok(Self { high, low })
    }

    pub fn high(&self) -> usize {
        self.high
    }

    pub fn low(&self) -> usize {
        self.low
    }
}

impl Default for Watermarks {
    fn default() -> Self {
        Self {
            high: DEFAULT_HIGH_WATERMARK,
            low: DEFAULT_LOW_WATERMARK,
        }
    }
}

/// Pending-byte accounting for one connection.
#[derive(Debug)]
pub(crate) struct FlowControl {
    watermarks: Watermarks,
    pending: usize,
    state: FlowState,
}

impl FlowControl {
    pub(crate) fn new(watermarks: Watermarks) -> Self {
        Self {
            watermarks,
            pending: 0,
            state: FlowState::Normal,
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending
    }

    pub(crate) fn state(&self) -> FlowState {
        self.state
    }

    pub(crate) fn watermarks(&self) -> Watermarks {
        self.watermarks
    }

    /// Account for `n` newly queued bytes. Returns `Some(Paused)` on the transition.
    pub(crate) fn on_enqueue(&mut self, n: usize) -> Option<FlowState> {
        self.pending += n;
        if self.state == FlowState::Normal && self.pending > self.watermarks.high {
            self.state = FlowState::Paused;
            return Some(FlowState::Paused);
        }
        None
    }

    /// Account for `n` bytes confirmed by the OS. Returns `Some(Normal)` on the transition.
    pub(crate) fn on_sent(&mut self, n: usize) -> Option<FlowState> {
        debug_assert!(n <= self.pending, "confirmed more bytes than were pending");
        self.pending = self.pending.saturating_sub(n);
        self.settle()
    }

    /// Drop all pending bytes (reset, abort, close deadline). Returns the bytes dropped.
    pub(crate) fn discard(&mut self) -> usize {
        let dropped = self.pending;
        self.pending = 0;
        self.state = FlowState::Normal;
        dropped
    }

    fn settle(&mut self) -> Option<FlowState> {
        if self.state == FlowState::Paused && self.pending <= self.watermarks.low {
            self.state = FlowState::Normal;
            return Some(FlowState::Normal);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(high: usize, low: usize) -> FlowControl {
        FlowControl::new(Watermarks::new(high, low).unwrap())
    }

    #[test]
    fn watermarks_require_low_below_high() {
        assert!(Watermarks::new(100, 10).is_ok());
        assert_eq!(
            Watermarks::new(100, 100),
            Err(WatermarkError { high: 100, low: 100 })
        );
        assert!(Watermarks::new(10, 100).is_err());
    }

    #[test]
    fn default_watermarks() {
        let w = Watermarks::default();
        assert_eq!(w.high(), 64 * 1024);
        assert_eq!(w.low(), 16 * 1024);
    }

    #[test]
    fn pauses_only_above_high() {
        let mut fc = flow(100, 20);
        assert_eq!(fc.on_enqueue(100), None, "exactly high must not pause");
        assert_eq!(fc.on_enqueue(1), Some(FlowState::Paused));
        assert_eq!(fc.state(), FlowState::Paused);
        // Already paused: no duplicate signal.
        assert_eq!(fc.on_enqueue(50), None);
        assert_eq!(fc.pending(), 151);
    }

    #[test]
    fn resumes_only_at_or_below_low() {
        let mut fc = flow(100, 20);
        fc.on_enqueue(150);
        assert_eq!(fc.on_sent(100), None, "50 pending is still above low");
        assert_eq!(fc.state(), FlowState::Paused);
        assert_eq!(fc.on_sent(30), Some(FlowState::Normal));
        assert_eq!(fc.pending(), 20);
        assert_eq!(fc.on_sent(20), None);
    }

    #[test]
    fn partial_writes_never_resume_early() {
        let mut fc = flow(1000, 100);
        fc.on_enqueue(5000);
        let mut resumed_at = None;
        for step in 0..50 {
            if fc.on_sent(100) == Some(FlowState::Normal) {
                resumed_at = Some(step);
                break;
            }
        }
        assert_eq!(resumed_at, Some(48));
        assert!(fc.pending() <= 100);
    }

    #[test]
    fn discard_resets_accounting() {
        let mut fc = flow(100, 20);
        fc.on_enqueue(500);
        assert_eq!(fc.discard(), 500);
        assert_eq!(fc.pending(), 0);
        assert_eq!(fc.state(), FlowState::Normal);
    }
}
