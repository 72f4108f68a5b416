//! Tally Server Entry Point
//!
//! Connects to Redis (cache, locks, queues) and PostgreSQL, verifies every
//! backend is reachable, then runs the reconciler and sweeper tasks until
//! Ctrl-C.

use std::sync::Arc;

use tally_core::{EngineConfig, TallyResult};
use tally_engine::{init_tracing, Engine, EngineParts, TelemetryConfig};
use tally_queue::{QueueConfig, RedisStreamQueue};
use tally_storage::{DbConfig, PgRelationStore, RedisCacheStore, RedisConfig, RedisLockBackend};

#[tokio::main]
async fn main() -> TallyResult<()> {
    let telemetry_config = TelemetryConfig::from_env();
    init_tracing(&telemetry_config)?;

    let config = EngineConfig::from_env();
    config.validate()?;
    let redis_config = RedisConfig::from_env();
    let queue_config = QueueConfig::from_env();
    let db_config = DbConfig::from_env();

    let store = PgRelationStore::from_config(&db_config)?;
    let mut parts = EngineParts::new(
        Arc::new(RedisCacheStore::connect(&redis_config).await?),
        Arc::new(RedisLockBackend::connect(&redis_config).await?),
        Arc::new(store.clone()),
    );
    for &domain in &config.domains {
        let queue = RedisStreamQueue::connect(
            &queue_config,
            domain.queue_name(),
            config.ack_mode,
            config.queue_block,
        )
        .await?;
        tracing::info!(
            domain = %domain,
            stream = queue.stream_key(),
            consumer = queue.consumer(),
            "Queue connected"
        );
        parts = parts.with_queue(domain, Arc::new(queue));
    }

    if let Err(e) = parts.ping().await {
        tracing::error!(error = %e, "Backend unreachable at startup");
        return Err(e);
    }
    store.ensure_schema().await?;
    tracing::info!(pool_size = store.pool_size(), "Relation store ready");

    let engine = Engine::start(parts, config)?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");

    let report = engine.shutdown().await;
    for (domain, snapshot) in &report.reconcilers {
        tracing::info!(domain = %domain, received = snapshot.received, applied = snapshot.applied(), "Reconciler summary");
    }
    for (domain, snapshot) in &report.sweepers {
        tracing::info!(domain = %domain, cycles = snapshot.cycles, inserted = snapshot.inserted, deleted = snapshot.deleted, "Sweeper summary");
    }
    Ok(())
}
