// ── Dispatch counters ──

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Running totals for one controller.
#[derive(Debug, Default)]
pub struct DispatchStats {
    received: AtomicU64,
    dispatched: AtomicU64,
    failed: AtomicU64,
    unroutable: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Messages pulled off the queue.
    pub received: u64,
    /// Handlers that returned `Ok`.
    pub dispatched: u64,
    /// Handlers that returned an error or panicked.
    pub failed: u64,
    /// Messages dropped for lack of a handler.
    pub unroutable: u64,
}

impl StatsSnapshot {
    /// Messages whose handling has finished one way or another.
    pub fn settled(&self) -> u64 {
        self.dispatched + self.failed + self.unroutable
    }
}

impl DispatchStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unroutable(&self) {
        self.unroutable.fetch_add(1, Ordering::Relaxed);
    }
}
