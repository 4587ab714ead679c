//! Engine counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Settlement engine metrics.
pub struct Metrics {
    /// Requests accepted by intake.
    pub submitted: AtomicU64,
    /// Approvals that committed.
    pub approved: AtomicU64,
    /// Cancellations that committed.
    pub cancelled: AtomicU64,
    /// Decisions refused because the transaction was no longer pending.
    pub rejected_state: AtomicU64,
    /// Approvals refused because a holding or balance would go negative.
    pub rejected_insufficient: AtomicU64,
    /// Store calls that failed or timed out.
    pub store_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            approved: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            rejected_state: AtomicU64::new(0),
            rejected_insufficient: AtomicU64::new(0),
            store_failures: AtomicU64::new(0),
        }
    }

    pub fn submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn approved(&self) {
        self.approved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected_state(&self) {
        self.rejected_state.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected_insufficient(&self) {
        self.rejected_insufficient.fetch_add(1, Ordering::Relaxed);
    }

    pub fn store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            approved: self.approved.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            rejected_state: self.rejected_state.load(Ordering::Relaxed),
            rejected_insufficient: self.rejected_insufficient.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub approved: u64,
    pub cancelled: u64,
    pub rejected_state: u64,
    pub rejected_insufficient: u64,
    pub store_failures: u64,
}

impl MetricsSnapshot {
    /// Decisions that reached a terminal state.
    pub fn settled(&self) -> u64 {
        self.approved + self.cancelled
    }
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.submitted();
        metrics.submitted();
        metrics.approved();
        metrics.rejected_state();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.submitted, 2);
        assert_eq!(snapshot.approved, 1);
        assert_eq!(snapshot.rejected_state, 1);
        assert_eq!(snapshot.settled(), 1);
    }
}
