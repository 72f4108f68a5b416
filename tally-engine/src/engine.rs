//! Runtime wiring.
//!
//! [`Engine::start`] spawns one reconciler and one sweeper per enabled
//! domain. All tasks share a single `watch` shutdown channel;
//! [`Engine::shutdown`] flips it and joins every task.

use crate::constants::DEFAULT_SHUTDOWN_TIMEOUT_SECS;
use crate::metrics::{ReconcilerSnapshot, SweepReport, SweeperSnapshot};
use crate::reconciler::Reconciler;
use crate::service::ActionService;
use crate::sweeper::Sweeper;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tally_core::{ConfigError, Domain, EngineConfig, TallyResult};
use tally_queue::ActionQueue;
use tally_storage::{ActionCache, CacheStore, LockBackend, LockManager, RelationStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;

// ============================================================================
// PARTS
// ============================================================================

/// Backends the engine runs on.
#[derive(Clone)]
pub struct EngineParts {
    pub cache_store: Arc<dyn CacheStore>,
    pub lock_backend: Arc<dyn LockBackend>,
    pub relation_store: Arc<dyn RelationStore>,
    pub queues: HashMap<Domain, Arc<dyn ActionQueue>>,
}

impl EngineParts {
    pub fn new(
        cache_store: Arc<dyn CacheStore>,
        lock_backend: Arc<dyn LockBackend>,
        relation_store: Arc<dyn RelationStore>,
    ) -> Self {
        Self {
            cache_store,
            lock_backend,
            relation_store,
            queues: HashMap::new(),
        }
    }

    pub fn with_queue(mut self, domain: Domain, queue: Arc<dyn ActionQueue>) -> Self {
        self.queues.insert(domain, queue);
        self
    }

    /// Ping every backend. The first failure is returned.
    pub async fn ping(&self) -> TallyResult<()> {
        self.cache_store.ping().await?;
        self.lock_backend.ping().await?;
        self.relation_store.ping().await?;
        for queue in self.queues.values() {
            queue.ping().await?;
        }
        tracing::info!(
            cache = self.cache_store.backend_name(),
            locks = self.lock_backend.backend_name(),
            store = self.relation_store.backend_name(),
            queues = self.queues.len(),
            "All backends reachable"
        );
        Ok(())
    }
}

// ============================================================================
// REPORT
// ============================================================================

/// Final metrics of every task, returned by [`Engine::shutdown`].
#[derive(Debug, Clone, Default)]
pub struct EngineReport {
    pub reconcilers: Vec<(Domain, ReconcilerSnapshot)>,
    pub sweepers: Vec<(Domain, SweeperSnapshot)>,
    /// Tasks that panicked or did not stop within the shutdown timeout
    pub failed_tasks: usize,
}

impl EngineReport {
    pub fn reconciler(&self, domain: Domain) -> Option<&ReconcilerSnapshot> {
        self.reconcilers
            .iter()
            .find(|(d, _)| *d == domain)
            .map(|(_, s)| s)
    }

    pub fn sweeper(&self, domain: Domain) -> Option<&SweeperSnapshot> {
        self.sweepers.iter().find(|(d, _)| *d == domain).map(|(_, s)| s)
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// A running set of reconciler and sweeper tasks.
pub struct Engine {
    config: EngineConfig,
    cache: ActionCache,
    locks: LockManager,
    service: ActionService,
    sweepers: HashMap<Domain, Sweeper>,
    shutdown_tx: watch::Sender<bool>,
    reconciler_tasks: Vec<(Domain, JoinHandle<ReconcilerSnapshot>)>,
    sweeper_tasks: Vec<(Domain, JoinHandle<SweeperSnapshot>)>,
    shutdown_timeout: Duration,
}

impl Engine {
    /// Validate `config` and spawn the tasks of every enabled domain.
    ///
    /// Must be called from within a Tokio runtime. Fails without spawning
    /// anything if the config is invalid or an enabled domain has no queue.
    pub fn start(parts: EngineParts, config: EngineConfig) -> TallyResult<Self> {
        config.validate()?;

        let mut queues = Vec::with_capacity(config.domains.len());
        for &domain in &config.domains {
            let queue = parts.queues.get(&domain).cloned().ok_or_else(|| {
                ConfigError::MissingRequired {
                    field: format!("queue for domain {}", domain),
                }
            })?;
            if queue.ack_mode() != config.ack_mode {
                tracing::warn!(
                    domain = %domain,
                    queue_ack_mode = %queue.ack_mode(),
                    configured_ack_mode = %config.ack_mode,
                    "Queue ack mode differs from engine config"
                );
            }
            queues.push((domain, queue));
        }

        let cache = ActionCache::new(parts.cache_store, config.read_ttl);
        let locks = LockManager::new(parts.lock_backend, config.lock.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut service = ActionService::new(cache.clone(), Arc::clone(&parts.relation_store));
        let mut sweepers = HashMap::new();
        let mut reconciler_tasks = Vec::new();
        let mut sweeper_tasks = Vec::new();

        for (domain, queue) in queues {
            service = service.with_queue(domain, Arc::clone(&queue));

            let reconciler = Reconciler::new(domain, queue, cache.clone(), locks.clone())
                .with_retry_delay(config.receive_retry_delay);
            reconciler_tasks.push((domain, tokio::spawn(reconciler.run(shutdown_rx.clone()))));

            let sweeper = Sweeper::new(
                domain,
                cache.clone(),
                Arc::clone(&parts.relation_store),
                locks.clone(),
            )
            .with_interval(config.sweep_interval(domain));
            sweepers.insert(domain, sweeper.clone());
            sweeper_tasks.push((domain, tokio::spawn(sweeper.run(shutdown_rx.clone()))));
        }

        tracing::info!(
            domains = ?config.domains,
            read_ttl_ms = config.read_ttl.as_millis() as u64,
            ack_mode = %config.ack_mode,
            "Engine started"
        );

        Ok(Self {
            config,
            cache,
            locks,
            service,
            sweepers,
            shutdown_tx,
            reconciler_tasks,
            sweeper_tasks,
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        })
    }

    /// How long [`Engine::shutdown`] waits for each task.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Producer and live-read facade bound to this engine's queues.
    pub fn service(&self) -> &ActionService {
        &self.service
    }

    pub fn cache(&self) -> &ActionCache {
        &self.cache
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Run a sweep cycle for `domain` now, alongside the periodic one.
    pub async fn sweep_now(&self, domain: Domain) -> TallyResult<SweepReport> {
        let sweeper = self
            .sweepers
            .get(&domain)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "domain".to_string(),
                value: domain.to_string(),
                reason: "domain not enabled".to_string(),
            })?;
        sweeper.sweep_once().await
    }

    /// Signal shutdown and wait for every task to stop.
    pub async fn shutdown(self) -> EngineReport {
        tracing::info!("Engine shutting down");
        let _ = self.shutdown_tx.send(true);

        let mut report = EngineReport::default();
        for (domain, handle) in self.reconciler_tasks {
            match join(handle, self.shutdown_timeout, domain, "reconciler").await {
                Some(snapshot) => report.reconcilers.push((domain, snapshot)),
                None => report.failed_tasks += 1,
            }
        }
        for (domain, handle) in self.sweeper_tasks {
            match join(handle, self.shutdown_timeout, domain, "sweeper").await {
                Some(snapshot) => report.sweepers.push((domain, snapshot)),
                None => report.failed_tasks += 1,
            }
        }

        tracing::info!(failed_tasks = report.failed_tasks, "Engine stopped");
        report
    }
}

async fn join<T>(
    mut handle: JoinHandle<T>,
    timeout: Duration,
    domain: Domain,
    task: &'static str,
) -> Option<T> {
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(snapshot)) => Some(snapshot),
        Ok(Err(e)) => {
            tracing::error!(domain = %domain, task, error = %e, "Task panicked");
            None
        }
        Err(_) => {
            tracing::error!(domain = %domain, task, "Task did not stop in time, aborting");
            handle.abort();
            None
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{AckMode, TallyError};
    use tally_queue::InMemoryQueue;
    use tally_storage::{InMemoryCacheStore, InMemoryLockBackend, InMemoryRelationStore};

    fn parts(domains: &[Domain]) -> EngineParts {
        let mut parts = EngineParts::new(
            Arc::new(InMemoryCacheStore::new()),
            Arc::new(InMemoryLockBackend::new()),
            Arc::new(InMemoryRelationStore::new()),
        );
        for &domain in domains {
            parts = parts.with_queue(
                domain,
                Arc::new(InMemoryQueue::new(
                    domain.queue_name(),
                    AckMode::Manual,
                    Duration::from_millis(10),
                )),
            );
        }
        parts
    }

    #[tokio::test]
    async fn test_start_requires_queue_per_domain() {
        let result = Engine::start(parts(&[Domain::Favorite]), EngineConfig::default());
        assert!(matches!(
            result,
            Err(TallyError::Config(ConfigError::MissingRequired { .. }))
        ));
    }

    #[tokio::test]
    async fn test_start_and_shutdown_report_every_task() {
        let parts = parts(&Domain::ALL);
        parts.ping().await.unwrap();
        let engine = Engine::start(parts, EngineConfig::default()).unwrap();
        let report = engine.shutdown().await;

        assert_eq!(report.failed_tasks, 0);
        assert_eq!(report.reconcilers.len(), 2);
        assert_eq!(report.sweepers.len(), 2);
        assert!(report.reconciler(Domain::Relation).is_some());
    }

    #[tokio::test]
    async fn test_sweep_now_rejects_disabled_domain() {
        let config = EngineConfig::default().with_domains([Domain::Relation]);
        let engine = Engine::start(parts(&[Domain::Relation]), config).unwrap();
        assert!(engine.sweep_now(Domain::Favorite).await.is_err());
        assert_eq!(engine.sweep_now(Domain::Relation).await.unwrap().scanned, 0);
        engine.shutdown().await;
    }
}
