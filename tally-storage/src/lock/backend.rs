//! Lock backend trait and the in-process implementation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tally_core::{LockError, TallyResult};
use tokio::time::Instant;

/// Lease-based mutual exclusion keyed by name.
///
/// Every holder presents a unique token; only the current holder's token
/// can release the lock. Leases expire on their own so a crashed holder
/// cannot wedge a domain.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Take the lock if free (or expired). Returns whether it was taken.
    async fn try_acquire(&self, name: &str, token: &str, lease: Duration) -> TallyResult<bool>;

    /// Release the lock if `token` still holds it. Returns `false` when the
    /// lease had already expired or passed to someone else.
    async fn release(&self, name: &str, token: &str) -> TallyResult<bool>;

    async fn ping(&self) -> TallyResult<()>;

    fn backend_name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
struct Lease {
    token: String,
    expires_at: Instant,
}

/// Process-local lock table. Suitable for a single engine process and for
/// tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockBackend {
    leases: Arc<Mutex<HashMap<String, Lease>>>,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token of the live holder of `name`, if any.
    pub fn holder(&self, name: &str) -> Option<String> {
        let now = Instant::now();
        let leases = self.leases.lock().ok()?;
        leases
            .get(name)
            .filter(|l| l.expires_at > now)
            .map(|l| l.token.clone())
    }

    fn poisoned(name: &str) -> LockError {
        LockError::Backend {
            name: name.to_string(),
            reason: "lock table poisoned".to_string(),
        }
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(&self, name: &str, token: &str, lease: Duration) -> TallyResult<bool> {
        let now = Instant::now();
        let mut leases = self.leases.lock().map_err(|_| Self::poisoned(name))?;
        match leases.get(name) {
            Some(current) if current.expires_at > now => Ok(false),
            _ => {
                leases.insert(
                    name.to_string(),
                    Lease {
                        token: token.to_string(),
                        expires_at: now + lease,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release(&self, name: &str, token: &str) -> TallyResult<bool> {
        let now = Instant::now();
        let mut leases = self.leases.lock().map_err(|_| Self::poisoned(name))?;
        match leases.get(name) {
            Some(current) if current.token == token => {
                let live = current.expires_at > now;
                leases.remove(name);
                Ok(live)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> TallyResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
