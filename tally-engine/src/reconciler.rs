//! Cache Reconciler Task
//!
//! One reconciler runs per domain. It takes action events off the domain's
//! queue and folds each into the cache under the lock guarding its pair:
//!
//! - no write view yet: write both views
//! - strictly newer than the recorded value: overwrite both views (a flip,
//!   or the same action with an advanced timestamp)
//! - otherwise: nothing to do; an older opposite action is stale
//!
//! Only the cache is touched here; the sweeper migrates write views into
//! the relation store.
//!
//! # Delivery handling
//!
//! | outcome                  | delivery                               |
//! |--------------------------|----------------------------------------|
//! | reconciled (any decision) | acked                                 |
//! | undecodable payload      | acked and dropped                      |
//! | lock or cache failure    | not acked; rejected with requeue       |
//!
//! In auto-ack mode the broker already forgot the message at receive time,
//! so a lock or cache failure loses that event.

use crate::metrics::{ReconcilerMetrics, ReconcilerSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tally_core::constants::DEFAULT_RECEIVE_RETRY_MS;
use tally_core::{
    reconcile, ActionEvent, CacheValue, Domain, ReconcileDecision, TallyError, TallyResult,
};
use tally_queue::{ActionQueue, Delivery};
use tally_storage::{ActionCache, LockManager};
use tokio::sync::watch;

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The event was folded into the cache (or found redundant) and acked.
    Completed(ReconcileDecision),
    /// The payload could not be decoded; acked without effect.
    Dropped,
    /// Processing failed; the delivery was handed back to the broker.
    Retry,
}

/// Consumer of one domain's action queue.
#[derive(Clone)]
pub struct Reconciler {
    domain: Domain,
    queue: Arc<dyn ActionQueue>,
    cache: ActionCache,
    locks: LockManager,
    retry_delay: Duration,
    metrics: Arc<ReconcilerMetrics>,
}

impl Reconciler {
    pub fn new(
        domain: Domain,
        queue: Arc<dyn ActionQueue>,
        cache: ActionCache,
        locks: LockManager,
    ) -> Self {
        Self {
            domain,
            queue,
            cache,
            locks,
            retry_delay: Duration::from_millis(DEFAULT_RECEIVE_RETRY_MS),
            metrics: Arc::new(ReconcilerMetrics::new()),
        }
    }

    /// Pause after a failed receive or a requeued delivery.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn metrics(&self) -> Arc<ReconcilerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Fold one event into the cache under its pair's lock.
    pub async fn apply_event(&self, event: &ActionEvent) -> TallyResult<ReconcileDecision> {
        let domain = self.domain;
        let pair = event.pair();
        let incoming = CacheValue::from(event);
        let cache = &self.cache;

        self.locks
            .with_lock(domain, pair, || async move {
                let existing = match cache.write_view(domain, pair).await {
                    Ok(existing) => existing,
                    Err(TallyError::Decode(e)) => {
                        // an unreadable entry carries no decision; replace it
                        tracing::warn!(
                            domain = %domain,
                            pair = %pair,
                            error = %e,
                            "Overwriting undecodable write view"
                        );
                        None
                    }
                    Err(e) => return Err(e),
                };
                let decision = reconcile(existing, incoming);
                if decision.writes() {
                    cache.put_both(domain, pair, incoming).await?;
                }
                Ok(decision)
            })
            .await
    }

    /// Decode, apply and settle one delivery.
    pub async fn handle_delivery(&self, delivery: &Delivery) -> DeliveryOutcome {
        ReconcilerMetrics::incr(&self.metrics.received);

        let event = match ActionEvent::decode(&delivery.body) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(
                    domain = %self.domain,
                    tag = %delivery.tag,
                    error = %e,
                    "Dropping malformed action event"
                );
                ReconcilerMetrics::incr(&self.metrics.malformed);
                self.ack(delivery).await;
                return DeliveryOutcome::Dropped;
            }
        };

        match self.apply_event(&event).await {
            Ok(decision) => {
                let counter = match decision {
                    ReconcileDecision::Insert => &self.metrics.inserted,
                    ReconcileDecision::Replace => &self.metrics.replaced,
                    ReconcileDecision::Refresh => &self.metrics.refreshed,
                    ReconcileDecision::Unchanged => &self.metrics.unchanged,
                    ReconcileDecision::Stale => &self.metrics.stale,
                };
                ReconcilerMetrics::incr(counter);
                tracing::debug!(
                    domain = %self.domain,
                    pair = %event.pair(),
                    action = %event.action_type,
                    created_at = event.created_at,
                    decision = ?decision,
                    "Action event reconciled"
                );
                self.ack(delivery).await;
                DeliveryOutcome::Completed(decision)
            }
            Err(TallyError::Lock(e)) => {
                tracing::warn!(
                    domain = %self.domain,
                    pair = %event.pair(),
                    error = %e,
                    "Lock unavailable, event not acknowledged"
                );
                ReconcilerMetrics::incr(&self.metrics.lock_failures);
                self.requeue(delivery).await;
                DeliveryOutcome::Retry
            }
            Err(e) => {
                tracing::error!(
                    domain = %self.domain,
                    pair = %event.pair(),
                    error = %e,
                    "Cache update failed, event not acknowledged"
                );
                ReconcilerMetrics::incr(&self.metrics.cache_errors);
                self.requeue(delivery).await;
                DeliveryOutcome::Retry
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        match self.queue.ack(delivery).await {
            Ok(()) => ReconcilerMetrics::incr(&self.metrics.acked),
            Err(e) => {
                tracing::warn!(domain = %self.domain, tag = %delivery.tag, error = %e, "Ack failed");
            }
        }
    }

    async fn requeue(&self, delivery: &Delivery) {
        if let Err(e) = self.queue.reject(delivery, true).await {
            tracing::warn!(domain = %self.domain, tag = %delivery.tag, error = %e, "Requeue failed");
        }
    }

    /// Sleep for the retry delay unless shutdown arrives first. Returns
    /// `true` on shutdown.
    async fn pause(&self, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.retry_delay) => false,
            changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
        }
    }

    /// Consume the queue until shutdown is signalled or the queue closes.
    ///
    /// A delivery being processed when shutdown arrives is finished and
    /// settled before the task returns.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> ReconcilerSnapshot {
        tracing::info!(
            domain = %self.domain,
            queue = %self.queue.name(),
            ack_mode = %self.queue.ack_mode(),
            lock_granularity = ?self.locks.config().granularity,
            "Reconciler task started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let received = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                received = self.queue.receive() => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    if self.handle_delivery(&delivery).await == DeliveryOutcome::Retry
                        && self.pause(&mut shutdown_rx).await
                    {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) if !e.is_transient() => {
                    tracing::warn!(domain = %self.domain, error = %e, "Queue closed, reconciler stopping");
                    break;
                }
                Err(e) => {
                    tracing::error!(domain = %self.domain, error = %e, "Receive failed");
                    ReconcilerMetrics::incr(&self.metrics.receive_errors);
                    if self.pause(&mut shutdown_rx).await {
                        break;
                    }
                }
            }
        }

        let snapshot = self.metrics.snapshot();
        tracing::info!(
            domain = %self.domain,
            received = snapshot.received,
            inserted = snapshot.inserted,
            replaced = snapshot.replaced,
            refreshed = snapshot.refreshed,
            unchanged = snapshot.unchanged,
            stale = snapshot.stale,
            malformed = snapshot.malformed,
            lock_failures = snapshot.lock_failures,
            cache_errors = snapshot.cache_errors,
            acked = snapshot.acked,
            "Reconciler task completed"
        );
        snapshot
    }
}

// ============================================================================
// TESTS
// ============================================================================
