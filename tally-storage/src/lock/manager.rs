//! Lock manager: bounded-wait acquisition and scoped critical sections.

use super::backend::LockBackend;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tally_core::{Domain, LockConfig, LockError, PairKey, TallyResult};
use tokio::time::Instant;
use uuid::Uuid;

/// Hands out [`LockGuard`]s for (domain, pair) critical sections.
///
/// Which mutex a pair maps to is decided by the configured
/// [`LockGranularity`](tally_core::LockGranularity).
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    config: LockConfig,
}

impl LockManager {
    pub fn new(backend: Arc<dyn LockBackend>, config: LockConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn LockBackend> {
        &self.backend
    }

    /// Name of the mutex guarding `pair`.
    pub fn lock_name(&self, domain: Domain, pair: PairKey) -> String {
        self.config.granularity.lock_name(domain, pair)
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = self.config.retry_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        self.config.retry_delay + Duration::from_millis(jitter)
    }

    /// Acquire the mutex guarding `pair`, retrying until the configured
    /// acquire timeout.
    pub async fn acquire(&self, domain: Domain, pair: PairKey) -> TallyResult<LockGuard> {
        let name = self.lock_name(domain, pair);
        let token = Uuid::now_v7().to_string();
        let started = Instant::now();

        loop {
            if self
                .backend
                .try_acquire(&name, &token, self.config.lease)
                .await?
            {
                tracing::trace!(lock = %name, waited_ms = started.elapsed().as_millis() as u64, "Lock acquired");
                return Ok(LockGuard {
                    name,
                    token,
                    backend: Arc::clone(&self.backend),
                    acquired_at: Instant::now(),
                    released: false,
                });
            }

            let waited = started.elapsed();
            if waited >= self.config.acquire_timeout {
                return Err(LockError::Timeout { name, waited }.into());
            }
            let delay = self.next_delay().min(self.config.acquire_timeout - waited);
            tokio::time::sleep(delay).await;
        }
    }

    /// Run `f` inside one critical section.
    ///
    /// The lock is always released once `f` finishes. If `f` succeeded but
    /// the release failed (lease lost), the release error is returned, since
    /// the section may not have been exclusive.
    pub async fn with_lock<F, Fut, T>(&self, domain: Domain, pair: PairKey, f: F) -> TallyResult<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = TallyResult<T>> + Send,
        T: Send,
    {
        let guard = self.acquire(domain, pair).await?;
        let result = f().await;
        let released = guard.release().await;
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                tracing::warn!(error = %release_err, "Lock release failed after a failed critical section");
                Err(e)
            }
        }
    }
}

/// Proof of holding a named lock.
///
/// [`LockGuard::release`] consumes the guard, so a handle cannot be
/// released twice. A guard dropped without release leaves the lock to
/// expire with its lease.
#[must_use = "a lock guard must be released"]
pub struct LockGuard {
    name: String,
    token: String,
    backend: Arc<dyn LockBackend>,
    acquired_at: Instant,
    released: bool,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How long the lock has been held.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Release the lock.
    ///
    /// Returns [`LockError::NotHeld`] if the lease expired before release;
    /// another holder may have entered the section meanwhile.
    pub async fn release(mut self) -> TallyResult<()> {
        self.released = true;
        let held = self.backend.release(&self.name, &self.token).await?;
        if held {
            Ok(())
        } else {
            Err(LockError::NotHeld {
                name: self.name.clone(),
            }
            .into())
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                lock = %self.name,
                held_ms = self.acquired_at.elapsed().as_millis() as u64,
                "Lock guard dropped without release; relying on lease expiry"
            );
        }
    }
}
