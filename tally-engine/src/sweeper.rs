//! Periodic Sweeper Task
//!
//! Migrates pending write views into the relation store. Each cycle walks
//! every write-view key of its domain:
//!
//! 1. read the recorded decision under the pair's lock
//! 2. check the store and apply or revoke the relation if needed (outside
//!    the lock; one transaction per mutation)
//! 3. under the lock again, delete both views if the write view still holds
//!    the value that was migrated
//!
//! If the reconciler recorded a newer decision between steps 1 and 3, the
//! key is left for the next cycle. A failure at any step also leaves the
//! key, so a crash never loses a decision; rerunning a step is harmless
//! because step 2 only mutates when the store disagrees with the decision.

use crate::metrics::{SweepReport, SweeperMetrics, SweeperSnapshot};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tally_core::constants::DEFAULT_SWEEP_INTERVAL_SECS;
use tally_core::{
    sweep_decision, CacheValue, Domain, PairKey, SweepAction, TallyError, TallyResult,
};
use tally_storage::{ActionCache, LockManager, RelationStore};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// What happened to one pending key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyOutcome {
    /// Migrated (or found redundant) and both views removed.
    Cleared(SweepAction),
    /// The write view changed while the store was updated.
    Superseded,
    /// The stored value could not be decoded and was removed.
    Malformed,
    /// The key disappeared between enumeration and read.
    Vanished,
}

/// Write-behind migrator for one domain.
#[derive(Clone)]
pub struct Sweeper {
    domain: Domain,
    cache: ActionCache,
    store: Arc<dyn RelationStore>,
    locks: LockManager,
    interval: Duration,
    metrics: Arc<SweeperMetrics>,
}

impl Sweeper {
    pub fn new(
        domain: Domain,
        cache: ActionCache,
        store: Arc<dyn RelationStore>,
        locks: LockManager,
    ) -> Self {
        Self {
            domain,
            cache,
            store,
            locks,
            interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            metrics: Arc::new(SweeperMetrics::new()),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn metrics(&self) -> Arc<SweeperMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run one sweep cycle over every pending key of the domain.
    ///
    /// Fails only if the keys cannot be enumerated; per-key failures are
    /// logged, counted in the report and do not stop the cycle.
    pub async fn sweep_once(&self) -> TallyResult<SweepReport> {
        let keys = self.cache.pending_keys(self.domain).await?;
        let mut report = SweepReport {
            scanned: keys.len() as u64,
            ..Default::default()
        };

        for key in keys {
            match self.sweep_key(key.pair).await {
                Ok(KeyOutcome::Cleared(action)) => match action {
                    SweepAction::Apply => report.inserted += 1,
                    SweepAction::Revoke => report.deleted += 1,
                    SweepAction::NoChange => report.noop += 1,
                    SweepAction::Discard => report.orphaned += 1,
                },
                Ok(KeyOutcome::Superseded) => report.superseded += 1,
                Ok(KeyOutcome::Malformed) => report.orphaned += 1,
                Ok(KeyOutcome::Vanished) => {}
                Err(e) => {
                    tracing::warn!(
                        domain = %self.domain,
                        pair = %key.pair,
                        error = %e,
                        "Sweep failed for key, leaving it for the next cycle"
                    );
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn sweep_key(&self, pair: PairKey) -> TallyResult<KeyOutcome> {
        let domain = self.domain;
        let cache = &self.cache;

        // critical section 1: snapshot the decision
        let snapshot = self
            .locks
            .with_lock(domain, pair, || async move {
                match cache.write_view(domain, pair).await {
                    Ok(value) => Ok(Some(value)),
                    Err(TallyError::Decode(e)) => {
                        tracing::error!(
                            domain = %domain,
                            pair = %pair,
                            error = %e,
                            "Discarding undecodable write view"
                        );
                        cache.remove(domain, pair).await?;
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            })
            .await?;
        let value = match snapshot {
            Some(Some(value)) => value,
            Some(None) => return Ok(KeyOutcome::Vanished),
            None => return Ok(KeyOutcome::Malformed),
        };

        let action = self.migrate(pair, value).await?;

        // critical section 2: compare and delete
        let cleared = self
            .locks
            .with_lock(domain, pair, || async move {
                match cache.write_view(domain, pair).await {
                    Ok(Some(current)) if current != value => Ok(false),
                    Ok(Some(_)) => {
                        cache.remove(domain, pair).await?;
                        Ok(true)
                    }
                    Ok(None) => Ok(true),
                    // a newer writer owns the key now
                    Err(TallyError::Decode(_)) => Ok(false),
                    Err(e) => Err(e),
                }
            })
            .await?;

        if cleared {
            tracing::debug!(
                domain = %domain,
                pair = %pair,
                action = action.as_str(),
                created_at = value.created_at,
                "Pending key migrated"
            );
            Ok(KeyOutcome::Cleared(action))
        } else {
            tracing::debug!(domain = %domain, pair = %pair, "Write view superseded during sweep");
            Ok(KeyOutcome::Superseded)
        }
    }

    /// Bring the store in line with `value`. Returns the action taken.
    async fn migrate(&self, pair: PairKey, value: CacheValue) -> TallyResult<SweepAction> {
        let entities_exist = self.store.entities_exist(self.domain, pair).await?;
        let row_exists = entities_exist && self.store.relation_exists(self.domain, pair).await?;

        let action = sweep_decision(row_exists, entities_exist, value.action_type);
        match action {
            SweepAction::Apply => {
                self.store
                    .apply_relation(self.domain, pair, value.created_at)
                    .await?
            }
            SweepAction::Revoke => self.store.revoke_relation(self.domain, pair).await?,
            SweepAction::Discard => {
                tracing::info!(
                    domain = %self.domain,
                    pair = %pair,
                    "Actor or target no longer exists, discarding pending key"
                );
            }
            SweepAction::NoChange => {}
        }
        Ok(action)
    }

    async fn run_cycle(&self) {
        match self.sweep_once().await {
            Ok(report) => {
                self.metrics.record(&report);
                if report.scanned > 0 {
                    tracing::info!(
                        domain = %self.domain,
                        scanned = report.scanned,
                        inserted = report.inserted,
                        deleted = report.deleted,
                        noop = report.noop,
                        orphaned = report.orphaned,
                        superseded = report.superseded,
                        failed = report.failed,
                        "Sweep cycle completed"
                    );
                } else {
                    tracing::trace!(domain = %self.domain, "Sweep cycle completed with no pending keys");
                }
            }
            Err(e) => {
                self.metrics.cycles.fetch_add(1, Ordering::Relaxed);
                self.metrics.cycle_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(domain = %self.domain, error = %e, "Failed to enumerate pending keys");
            }
        }
    }

    /// Sweep on a fixed interval until shutdown is signalled.
    ///
    /// The first cycle runs immediately. A cycle in progress when shutdown
    /// arrives runs to completion.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> SweeperSnapshot {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            domain = %self.domain,
            interval_ms = self.interval.as_millis() as u64,
            store = self.store.backend_name(),
            "Sweeper task started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }

        let snapshot = self.metrics.snapshot();
        tracing::info!(
            domain = %self.domain,
            cycles = snapshot.cycles,
            scanned = snapshot.scanned,
            inserted = snapshot.inserted,
            deleted = snapshot.deleted,
            orphaned = snapshot.orphaned,
            superseded = snapshot.superseded,
            failed = snapshot.failed,
            "Sweeper task completed"
        );
        snapshot
    }
}

// ============================================================================
// TESTS
// ============================================================================
