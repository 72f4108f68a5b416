//! End-to-end runs of the engine over in-memory backends.

use std::sync::Arc;
use std::time::Duration;
use tally_core::{AckMode, ActionType, CacheValue, Domain, EngineConfig, LockConfig, PairKey};
use tally_engine::{DeliveryOutcome, Engine, EngineParts, Reconciler};
use tally_queue::ActionQueue;
use tally_storage::{ActionCache, LockManager, RelationStore};
use tally_test_utils::{FlakyCacheStore, InMemoryBackends};

const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

fn parts(backends: &InMemoryBackends) -> EngineParts {
    EngineParts::new(
        Arc::new(backends.cache.clone()),
        Arc::new(backends.locks.clone()),
        Arc::new(backends.store.clone()),
    )
    .with_queue(Domain::Favorite, Arc::new(backends.favorite_queue.clone()))
    .with_queue(Domain::Relation, Arc::new(backends.relation_queue.clone()))
}

fn config() -> EngineConfig {
    EngineConfig::default()
        .with_queue_block(Duration::from_millis(20))
        .with_receive_retry_delay(Duration::from_millis(10))
        .with_sweep_interval(Domain::Favorite, Duration::from_secs(3600))
        .with_sweep_interval(Domain::Relation, Duration::from_secs(3600))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_actions_flow_from_service_to_store() {
    let backends = InMemoryBackends::seeded();
    let engine = Engine::start(parts(&backends), config()).unwrap();
    let service = engine.service().clone();
    // let the immediate first sweep cycles pass
    tokio::time::sleep(Duration::from_millis(50)).await;

    service.apply_favorite(1, 102).await.unwrap();
    service.apply_follow(1, 2).await.unwrap();
    service.apply_follow(2, 1).await.unwrap();
    service.apply_follow(1, 3).await.unwrap();
    service.revoke_follow(1, 3).await.unwrap();
    assert!(backends.wait_queues_idle(IDLE_TIMEOUT).await);

    // live reads see the cache before any migration
    assert!(service.is_favorited(1, 102).await.unwrap());
    assert!(service.is_following(2, 1).await.unwrap());
    assert!(!service.is_following(1, 3).await.unwrap());
    assert!(service.friend_list(1).await.unwrap().is_empty());

    let favorites = engine.sweep_now(Domain::Favorite).await.unwrap();
    let relations = engine.sweep_now(Domain::Relation).await.unwrap();
    assert_eq!(favorites.inserted, 1);
    assert_eq!(relations.inserted, 2);
    assert_eq!(relations.noop, 1);

    assert_eq!(service.favorite_list(1).await.unwrap(), vec![102]);
    assert_eq!(service.friend_list(1).await.unwrap(), vec![2]);
    assert_eq!(service.follower_list(1).await.unwrap(), vec![2]);
    assert!(backends.store.counter_mismatches().is_empty());

    let report = engine.shutdown().await;
    assert_eq!(report.failed_tasks, 0);
    let favorite = report.reconciler(Domain::Favorite).unwrap();
    assert_eq!(favorite.inserted, 1);
    let relation = report.reconciler(Domain::Relation).unwrap();
    assert_eq!(relation.received, 4);
    assert_eq!(relation.acked, 4);
    assert_eq!(relation.inserted, 3);
    assert_eq!(relation.replaced, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_transaction_is_retried_next_cycle() {
    let backends = InMemoryBackends::seeded();
    let engine = Engine::start(parts(&backends), config()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    engine.service().apply_follow(4, 5).await.unwrap();
    assert!(backends.wait_queues_idle(IDLE_TIMEOUT).await);

    backends.store.set_fail_transactions(true);
    let report = engine.sweep_now(Domain::Relation).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(
        engine.cache().pending_keys(Domain::Relation).await.unwrap().len(),
        1
    );

    backends.store.set_fail_transactions(false);
    let report = engine.sweep_now(Domain::Relation).await.unwrap();
    assert_eq!(report.inserted, 1);
    assert!(backends
        .store
        .relation_exists(Domain::Relation, PairKey::new(4, 5))
        .await
        .unwrap());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_cache_outage_requeues_until_it_recovers() {
    let backends = InMemoryBackends::new(AckMode::Manual, Duration::from_millis(10));
    let flaky = FlakyCacheStore::new(Arc::new(backends.cache.clone()));
    let cache = ActionCache::new(Arc::new(flaky.clone()), Duration::from_secs(6));
    let locks = LockManager::new(Arc::new(backends.locks.clone()), LockConfig::default());
    let queue = backends.relation_queue.clone();
    let reconciler = Reconciler::new(Domain::Relation, Arc::new(queue.clone()), cache.clone(), locks);

    queue
        .publish(&tally_core::ActionEvent::new(1, 2, ActionType::Apply, 7).encode())
        .await
        .unwrap();

    flaky.set_fail_reads(true);
    let delivery = queue.receive().await.unwrap().unwrap();
    assert_eq!(reconciler.handle_delivery(&delivery).await, DeliveryOutcome::Retry);
    assert_eq!(queue.len(), 1);
    assert!(flaky.injected_failures() >= 1);

    flaky.set_fail_reads(false);
    let delivery = queue.receive().await.unwrap().unwrap();
    assert!(delivery.redelivered);
    assert!(matches!(
        reconciler.handle_delivery(&delivery).await,
        DeliveryOutcome::Completed(_)
    ));
    assert!(queue.is_empty());
    assert_eq!(queue.in_flight(), 0);
    assert_eq!(
        cache.write_view(Domain::Relation, PairKey::new(1, 2)).await.unwrap(),
        Some(CacheValue::new(7, ActionType::Apply))
    );

    let snapshot = reconciler.metrics().snapshot();
    assert_eq!(snapshot.cache_errors, 1);
    assert_eq!(snapshot.inserted, 1);
}
