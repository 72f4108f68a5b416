//! In-memory backend bundles and fault injection.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tally_core::{AckMode, CacheError, Domain, TallyResult};
use tally_queue::InMemoryQueue;
use tally_storage::{
    CacheStore, CacheWrite, InMemoryCacheStore, InMemoryLockBackend, InMemoryRelationStore,
};

use crate::seed_world;

// ============================================================================
// BACKEND BUNDLE
// ============================================================================

/// Every backend the engine needs, in memory, with handles kept for
/// inspection.
#[derive(Debug, Clone)]
pub struct InMemoryBackends {
    pub cache: InMemoryCacheStore,
    pub locks: InMemoryLockBackend,
    pub store: InMemoryRelationStore,
    pub favorite_queue: InMemoryQueue,
    pub relation_queue: InMemoryQueue,
}

impl InMemoryBackends {
    /// Empty backends; queues use `ack_mode` and block for at most `block`.
    pub fn new(ack_mode: AckMode, block: Duration) -> Self {
        Self {
            cache: InMemoryCacheStore::new(),
            locks: InMemoryLockBackend::new(),
            store: InMemoryRelationStore::new(),
            favorite_queue: InMemoryQueue::new(Domain::Favorite.queue_name(), ack_mode, block),
            relation_queue: InMemoryQueue::new(Domain::Relation.queue_name(), ack_mode, block),
        }
    }

    /// Manual-ack backends over a store seeded by [`seed_world`].
    pub fn seeded() -> Self {
        let backends = Self::new(AckMode::Manual, Duration::from_millis(20));
        // seeding a fresh in-memory store cannot fail
        let _ = seed_world(&backends.store);
        backends
    }

    pub fn queue(&self, domain: Domain) -> &InMemoryQueue {
        match domain {
            Domain::Favorite => &self.favorite_queue,
            Domain::Relation => &self.relation_queue,
        }
    }

    /// Whether every queue is drained and nothing is awaiting an ack.
    pub fn queues_idle(&self) -> bool {
        [&self.favorite_queue, &self.relation_queue]
            .iter()
            .all(|q| q.is_empty() && q.in_flight() == 0)
    }

    /// Poll until both queues are idle or `timeout` passes.
    pub async fn wait_queues_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.queues_idle() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        true
    }
}

// ============================================================================
// FAULT INJECTION
// ============================================================================

/// Cache store wrapper whose reads and writes can be made to fail.
#[derive(Clone)]
pub struct FlakyCacheStore {
    inner: Arc<dyn CacheStore>,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
    injected: Arc<AtomicU64>,
}

impl FlakyCacheStore {
    pub fn new(inner: Arc<dyn CacheStore>) -> Self {
        Self {
            inner,
            fail_reads: Arc::new(AtomicBool::new(false)),
            fail_writes: Arc::new(AtomicBool::new(false)),
            injected: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of operations failed on purpose so far.
    pub fn injected_failures(&self) -> u64 {
        self.injected.load(Ordering::SeqCst)
    }

    fn check(&self, flag: &AtomicBool, operation: &str) -> TallyResult<()> {
        if flag.load(Ordering::SeqCst) {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(CacheError::OperationFailed {
                operation: operation.to_string(),
                reason: "injected failure".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for FlakyCacheStore {
    async fn get(&self, key: &str) -> TallyResult<Option<String>> {
        self.check(&self.fail_reads, "GET")?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> TallyResult<()> {
        self.check(&self.fail_writes, "SET")?;
        self.inner.set(key, value, ttl).await
    }

    async fn set_many(&self, writes: &[CacheWrite]) -> TallyResult<()> {
        self.check(&self.fail_writes, "SET")?;
        self.inner.set_many(writes).await
    }

    async fn delete(&self, keys: &[String]) -> TallyResult<u64> {
        self.check(&self.fail_writes, "DEL")?;
        self.inner.delete(keys).await
    }

    async fn scan(&self, pattern: &str) -> TallyResult<Vec<String>> {
        self.check(&self.fail_reads, "SCAN")?;
        self.inner.scan(pattern).await
    }

    async fn ping(&self) -> TallyResult<()> {
        self.inner.ping().await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_queue::ActionQueue;

    #[tokio::test]
    async fn test_flaky_store_fails_on_demand() {
        let flaky = FlakyCacheStore::new(Arc::new(InMemoryCacheStore::new()));
        flaky.set("k", "v", None).await.unwrap();

        flaky.set_fail_writes(true);
        assert!(flaky.set("k", "w", None).await.is_err());
        assert_eq!(flaky.get("k").await.unwrap(), Some("v".to_string()));

        flaky.set_fail_reads(true);
        assert!(flaky.get("k").await.is_err());
        assert_eq!(flaky.injected_failures(), 2);
    }

    #[test]
    fn test_seeded_backends_are_idle() {
        let backends = InMemoryBackends::seeded();
        assert!(backends.queues_idle());
        assert_eq!(backends.queue(Domain::Relation).name(), "relation");
    }
}
