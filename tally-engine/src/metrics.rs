//! Task metrics.
//!
//! Plain atomic counters. Each task owns one set, logs a snapshot when it
//! stops and returns that snapshot from its join handle.

use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// RECONCILER
// ============================================================================

/// Counters for one reconciler task.
#[derive(Debug, Default)]
pub struct ReconcilerMetrics {
    /// Deliveries taken from the queue
    pub received: AtomicU64,
    /// Events written as a new cache entry
    pub inserted: AtomicU64,
    /// Events that overwrote an older opposite action
    pub replaced: AtomicU64,
    /// Newer events repeating the recorded action
    pub refreshed: AtomicU64,
    /// Events matching the recorded action, not newer
    pub unchanged: AtomicU64,
    /// Events older than the recorded opposite action
    pub stale: AtomicU64,
    /// Undecodable deliveries dropped
    pub malformed: AtomicU64,
    pub lock_failures: AtomicU64,
    pub cache_errors: AtomicU64,
    pub receive_errors: AtomicU64,
    pub acked: AtomicU64,
}

impl ReconcilerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> ReconcilerSnapshot {
        ReconcilerSnapshot {
            received: self.received.load(Ordering::Relaxed),
            inserted: self.inserted.load(Ordering::Relaxed),
            replaced: self.replaced.load(Ordering::Relaxed),
            refreshed: self.refreshed.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            lock_failures: self.lock_failures.load(Ordering::Relaxed),
            cache_errors: self.cache_errors.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of reconciler metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilerSnapshot {
    pub received: u64,
    pub inserted: u64,
    pub replaced: u64,
    pub refreshed: u64,
    pub unchanged: u64,
    pub stale: u64,
    pub malformed: u64,
    pub lock_failures: u64,
    pub cache_errors: u64,
    pub receive_errors: u64,
    pub acked: u64,
}

impl ReconcilerSnapshot {
    /// Events that changed the cache.
    pub fn applied(&self) -> u64 {
        self.inserted + self.replaced + self.refreshed
    }
}

// ============================================================================
// SWEEPER
// ============================================================================

/// Counters for one sweeper task, accumulated over all cycles.
#[derive(Debug, Default)]
pub struct SweeperMetrics {
    pub cycles: AtomicU64,
    /// Cycles that could not enumerate keys
    pub cycle_errors: AtomicU64,
    pub scanned: AtomicU64,
    pub inserted: AtomicU64,
    pub deleted: AtomicU64,
    pub noop: AtomicU64,
    pub orphaned: AtomicU64,
    pub superseded: AtomicU64,
    pub failed: AtomicU64,
}

impl SweeperMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one cycle's report into the running totals.
    pub fn record(&self, report: &SweepReport) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.scanned.fetch_add(report.scanned, Ordering::Relaxed);
        self.inserted.fetch_add(report.inserted, Ordering::Relaxed);
        self.deleted.fetch_add(report.deleted, Ordering::Relaxed);
        self.noop.fetch_add(report.noop, Ordering::Relaxed);
        self.orphaned.fetch_add(report.orphaned, Ordering::Relaxed);
        self.superseded.fetch_add(report.superseded, Ordering::Relaxed);
        self.failed.fetch_add(report.failed, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SweeperSnapshot {
        SweeperSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            cycle_errors: self.cycle_errors.load(Ordering::Relaxed),
            scanned: self.scanned.load(Ordering::Relaxed),
            inserted: self.inserted.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            noop: self.noop.load(Ordering::Relaxed),
            orphaned: self.orphaned.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of sweeper metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweeperSnapshot {
    pub cycles: u64,
    pub cycle_errors: u64,
    pub scanned: u64,
    pub inserted: u64,
    pub deleted: u64,
    pub noop: u64,
    pub orphaned: u64,
    pub superseded: u64,
    pub failed: u64,
}

/// Outcome of a single sweep cycle.
///
/// `inserted`, `deleted`, `noop` and `orphaned` count keys whose views were
/// removed; `superseded` and `failed` count keys left for the next cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: u64,
    pub inserted: u64,
    pub deleted: u64,
    pub noop: u64,
    pub orphaned: u64,
    pub superseded: u64,
    pub failed: u64,
}

impl SweepReport {
    /// Keys migrated and cleared this cycle.
    pub fn cleared(&self) -> u64 {
        self.inserted + self.deleted + self.noop + self.orphaned
    }

    /// Keys still pending after this cycle.
    pub fn remaining(&self) -> u64 {
        self.superseded + self.failed
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconciler_snapshot() {
        let metrics = ReconcilerMetrics::new();
        ReconcilerMetrics::incr(&metrics.received);
        ReconcilerMetrics::incr(&metrics.received);
        ReconcilerMetrics::incr(&metrics.inserted);
        ReconcilerMetrics::incr(&metrics.replaced);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.applied(), 2);
        assert_eq!(snapshot.stale, 0);
    }

    #[test]
    fn test_sweeper_record_accumulates() {
        let metrics = SweeperMetrics::new();
        let report = SweepReport {
            scanned: 4,
            inserted: 1,
            deleted: 1,
            noop: 1,
            superseded: 1,
            ..Default::default()
        };
        metrics.record(&report);
        metrics.record(&report);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cycles, 2);
        assert_eq!(snapshot.scanned, 8);
        assert_eq!(snapshot.superseded, 2);
        assert_eq!(report.cleared(), 3);
        assert_eq!(report.remaining(), 1);
    }
}
