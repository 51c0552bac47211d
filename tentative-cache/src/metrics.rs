//! In-process counters for the reconciliation engine.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ReconcileMetrics {
    /// Optimistic writes applied to the store.
    pub optimistic_writes: AtomicU64,

    /// Transforms that failed before any remote call.
    pub transform_failures: AtomicU64,

    /// Snapshots restored after a remote failure.
    pub rollbacks: AtomicU64,

    /// Mutations settled after the remote call succeeded.
    pub settled_ok: AtomicU64,

    /// Mutations settled after the remote call failed.
    pub settled_failed: AtomicU64,

    /// Refetches that wrote a server value.
    pub refetches_ok: AtomicU64,

    /// Refetches whose remote call failed or timed out.
    pub refetches_failed: AtomicU64,

    /// Refetches skipped or discarded because a mutation was in flight.
    pub refetches_skipped: AtomicU64,
}

impl ReconcileMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> ReconcileMetricsSnapshot {
        ReconcileMetricsSnapshot {
            optimistic_writes: self.optimistic_writes.load(Ordering::Relaxed),
            transform_failures: self.transform_failures.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            settled_ok: self.settled_ok.load(Ordering::Relaxed),
            settled_failed: self.settled_failed.load(Ordering::Relaxed),
            refetches_ok: self.refetches_ok.load(Ordering::Relaxed),
            refetches_failed: self.refetches_failed.load(Ordering::Relaxed),
            refetches_skipped: self.refetches_skipped.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of reconciliation metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileMetricsSnapshot {
    pub optimistic_writes: u64,
    pub transform_failures: u64,
    pub rollbacks: u64,
    pub settled_ok: u64,
    pub settled_failed: u64,
    pub refetches_ok: u64,
    pub refetches_failed: u64,
    pub refetches_skipped: u64,
}

impl ReconcileMetricsSnapshot {
    pub fn settled(&self) -> u64 {
        self.settled_ok + self.settled_failed
    }
}
