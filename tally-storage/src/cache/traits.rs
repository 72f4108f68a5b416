//! Cache store trait.

use async_trait::async_trait;
use std::time::Duration;
use tally_core::TallyResult;

/// One entry of a batched write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheWrite {
    pub key: String,
    pub value: String,
    /// `None` keeps the entry until it is deleted.
    pub ttl: Option<Duration>,
}

impl CacheWrite {
    pub fn new(key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ttl,
        }
    }
}

/// Raw string key-value store backing the read and write views.
///
/// Implementations must be safe to share between the reconciler, the
/// sweeper and live readers. Patterns passed to [`CacheStore::scan`] only
/// use `*` as a wildcard.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get a value, `None` when absent or expired.
    async fn get(&self, key: &str) -> TallyResult<Option<String>>;

    /// Set a value, replacing any previous one and its TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> TallyResult<()>;

    /// Apply several writes as one unit where the backend supports it.
    async fn set_many(&self, writes: &[CacheWrite]) -> TallyResult<()> {
        for write in writes {
            self.set(&write.key, &write.value, write.ttl).await?;
        }
        Ok(())
    }

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> TallyResult<u64>;

    /// Enumerate live keys matching a glob pattern. Order is unspecified.
    async fn scan(&self, pattern: &str) -> TallyResult<Vec<String>>;

    /// Verify the backend is reachable.
    async fn ping(&self) -> TallyResult<()>;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}
