//! Progress reporting and cooperative abort.
//!
//! The engine publishes monotonically increasing counters through lock-free
//! atomics; an external observer polls [`ProgressTracker::snapshot`] and may
//! raise the abort flag at any time. Long-running operations call
//! [`ProgressTracker::checkpoint`] at every recursion step and every file
//! boundary, turning a raised flag into the distinct [`Error::Aborted`]
//! outcome.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Shared progress and cancellation handle.
///
/// Cloneable by reference (`Arc<ProgressTracker>`); never blocks on the
/// observer.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    processed: AtomicU64,
    total: AtomicU64,
    aborted: AtomicBool,
    current: Mutex<String>,
}

/// Point-in-time copy of the tracker state for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub processed: u64,
    pub total: u64,
    /// Path or item currently being worked on, if any.
    pub current: String,
}

impl ProgressTracker {
    pub fn new() -> ProgressTracker {
        ProgressTracker::default()
    }

    /// Declare the precomputed total for the upcoming operation and reset
    /// the processed counter.
    pub fn begin(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
        self.processed.store(0, Ordering::Relaxed);
    }

    /// Record one completed item.
    pub fn advance(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the item currently being processed, for display only.
    pub fn set_current(&self, item: impl Into<String>) {
        *self.current.lock() = item.into();
    }

    /// Request a cooperative stop.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    /// True once an abort has been requested.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    /// Raise [`Error::Aborted`] if an abort has been requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_aborted() {
            Err(Error::Aborted)
        } else {
            Ok(())
        }
    }

    /// Point-in-time copy for the observer.
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
            current: self.current.lock().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let tracker = ProgressTracker::new();
        tracker.begin(10);
        tracker.advance();
        tracker.advance();
        tracker.set_current("Norder3/Dir0/Npix42.fits");

        let snap = tracker.snapshot();
        assert_eq!(snap.processed, 2);
        assert_eq!(snap.total, 10);
        assert_eq!(snap.current, "Norder3/Dir0/Npix42.fits");
    }

    #[test]
    fn test_begin_resets_processed() {
        let tracker = ProgressTracker::new();
        tracker.begin(5);
        tracker.advance();
        tracker.begin(7);
        assert_eq!(tracker.snapshot().processed, 0);
        assert_eq!(tracker.snapshot().total, 7);
    }

    #[test]
    fn test_checkpoint_raises_aborted() {
        let tracker = ProgressTracker::new();
        assert!(tracker.checkpoint().is_ok());
        tracker.abort();
        let err = tracker.checkpoint().unwrap_err();
        assert!(err.is_abort());
    }
}
