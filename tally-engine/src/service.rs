//! Producing boundary and live reads.
//!
//! Writes never touch the cache or the store directly: an action is stamped,
//! validated and published to its domain's queue, and the request succeeds
//! once the broker has it. Reads prefer the short-lived read view and fall
//! back to the relation store.

use std::collections::HashMap;
use std::sync::Arc;
use tally_core::{
    ActionEvent, ActionType, Domain, EventClock, PairKey, QueueError, TallyError, TallyResult,
};
use tally_queue::ActionQueue;
use tally_storage::{ActionCache, RelationStore};

/// Facade used by request handlers.
#[derive(Clone)]
pub struct ActionService {
    queues: HashMap<Domain, Arc<dyn ActionQueue>>,
    cache: ActionCache,
    store: Arc<dyn RelationStore>,
    clock: Arc<EventClock>,
}

impl ActionService {
    pub fn new(cache: ActionCache, store: Arc<dyn RelationStore>) -> Self {
        Self {
            queues: HashMap::new(),
            cache,
            store,
            clock: Arc::new(EventClock::new()),
        }
    }

    /// Register the queue that carries `domain`'s events.
    pub fn with_queue(mut self, domain: Domain, queue: Arc<dyn ActionQueue>) -> Self {
        self.queues.insert(domain, queue);
        self
    }

    /// Share a clock with other producers in this process.
    pub fn with_clock(mut self, clock: Arc<EventClock>) -> Self {
        self.clock = clock;
        self
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Stamp an action and publish it. Returns the published event.
    pub async fn record(
        &self,
        domain: Domain,
        actor_id: i64,
        target_id: i64,
        action_type: ActionType,
    ) -> TallyResult<ActionEvent> {
        let queue = self.queues.get(&domain).ok_or_else(|| QueueError::Unavailable {
            queue: domain.queue_name().to_string(),
            reason: "no queue registered for domain".to_string(),
        })?;
        let event = ActionEvent::new(actor_id, target_id, action_type, self.clock.now());
        queue.publish(&event.encode()).await?;
        tracing::debug!(
            domain = %domain,
            pair = %event.pair(),
            action = %action_type,
            created_at = event.created_at,
            "Action published"
        );
        Ok(event)
    }

    /// Publish an action given its raw wire type; anything but 1 or 2 is
    /// rejected before it reaches the queue.
    pub async fn submit(
        &self,
        domain: Domain,
        actor_id: i64,
        target_id: i64,
        raw_action: i64,
    ) -> TallyResult<ActionEvent> {
        let action_type = ActionType::try_from(raw_action)?;
        self.record(domain, actor_id, target_id, action_type).await
    }

    pub async fn apply_favorite(&self, user_id: i64, video_id: i64) -> TallyResult<ActionEvent> {
        self.record(Domain::Favorite, user_id, video_id, ActionType::Apply)
            .await
    }

    pub async fn revoke_favorite(&self, user_id: i64, video_id: i64) -> TallyResult<ActionEvent> {
        self.record(Domain::Favorite, user_id, video_id, ActionType::Revoke)
            .await
    }

    pub async fn apply_follow(&self, user_id: i64, to_user_id: i64) -> TallyResult<ActionEvent> {
        self.record(Domain::Relation, user_id, to_user_id, ActionType::Apply)
            .await
    }

    pub async fn revoke_follow(&self, user_id: i64, to_user_id: i64) -> TallyResult<ActionEvent> {
        self.record(Domain::Relation, user_id, to_user_id, ActionType::Revoke)
            .await
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Whether the relation currently holds, as seen by a live read.
    ///
    /// A read-view hit decides. A miss, or a value that cannot be read,
    /// falls back to the relation store.
    pub async fn is_applied(&self, domain: Domain, pair: PairKey) -> TallyResult<bool> {
        match self.cache.read_view(domain, pair).await {
            Ok(Some(value)) => return Ok(value.action_type == ActionType::Apply),
            Ok(None) => {}
            Err(TallyError::Decode(e)) => {
                tracing::debug!(domain = %domain, pair = %pair, error = %e, "Undecodable read view");
            }
            Err(e) => {
                tracing::warn!(domain = %domain, pair = %pair, error = %e, "Read view unavailable");
            }
        }
        self.store.relation_exists(domain, pair).await
    }

    pub async fn is_favorited(&self, user_id: i64, video_id: i64) -> TallyResult<bool> {
        self.is_applied(Domain::Favorite, PairKey::new(user_id, video_id))
            .await
    }

    pub async fn is_following(&self, user_id: i64, to_user_id: i64) -> TallyResult<bool> {
        self.is_applied(Domain::Relation, PairKey::new(user_id, to_user_id))
            .await
    }

    /// Videos a user has favorited, newest first.
    pub async fn favorite_list(&self, user_id: i64) -> TallyResult<Vec<i64>> {
        self.store.list_targets(Domain::Favorite, user_id).await
    }

    /// Users a user follows, newest first.
    pub async fn follow_list(&self, user_id: i64) -> TallyResult<Vec<i64>> {
        self.store.list_targets(Domain::Relation, user_id).await
    }

    /// Followers of a user, newest first.
    pub async fn follower_list(&self, user_id: i64) -> TallyResult<Vec<i64>> {
        self.store.list_actors(Domain::Relation, user_id).await
    }

    /// Users that follow each other with `user_id`.
    pub async fn friend_list(&self, user_id: i64) -> TallyResult<Vec<i64>> {
        self.store.list_friends(user_id).await
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tally_core::{AckMode, CacheValue, ValidationError};
    use tally_queue::InMemoryQueue;
    use tally_storage::{CacheStore, InMemoryCacheStore, InMemoryRelationStore};

    struct Fixture {
        favorites: InMemoryQueue,
        raw: InMemoryCacheStore,
        cache: ActionCache,
        store: InMemoryRelationStore,
        service: ActionService,
    }

    fn fixture() -> Fixture {
        let favorites = InMemoryQueue::new("favorite", AckMode::Manual, Duration::from_millis(10));
        let raw = InMemoryCacheStore::new();
        let cache = ActionCache::new(Arc::new(raw.clone()), Duration::from_secs(6));
        let store = InMemoryRelationStore::new();
        let service = ActionService::new(cache.clone(), Arc::new(store.clone()))
            .with_queue(Domain::Favorite, Arc::new(favorites.clone()));
        Fixture {
            favorites,
            raw,
            cache,
            store,
            service,
        }
    }

    #[tokio::test]
    async fn test_publish_stamps_increasing_timestamps() {
        let f = fixture();
        let first = f.service.apply_favorite(1, 100).await.unwrap();
        let second = f.service.revoke_favorite(1, 100).await.unwrap();
        assert!(second.created_at > first.created_at);
        assert_eq!(f.favorites.len(), 2);

        let delivery = f.favorites.receive().await.unwrap().unwrap();
        assert_eq!(ActionEvent::decode(&delivery.body).unwrap(), first);
    }

    #[tokio::test]
    async fn test_submit_rejects_unknown_action_type() {
        let f = fixture();
        let err = f.service.submit(Domain::Favorite, 1, 100, 3).await.unwrap_err();
        assert!(matches!(
            err,
            TallyError::Validation(ValidationError::InvalidActionType { value: 3 })
        ));
        assert!(f.favorites.is_empty());

        let event = f.service.submit(Domain::Favorite, 1, 100, 2).await.unwrap();
        assert_eq!(event.action_type, ActionType::Revoke);
    }

    #[tokio::test]
    async fn test_unregistered_domain_is_unavailable() {
        let f = fixture();
        let err = f.service.apply_follow(1, 2).await.unwrap_err();
        assert!(matches!(err, TallyError::Queue(QueueError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn test_read_view_hit_decides() {
        let f = fixture();
        f.store.insert_user(1).unwrap();
        f.store.insert_user(3).unwrap();
        f.store.insert_video(100, 3).unwrap();
        f.store
            .apply_relation(Domain::Favorite, PairKey::new(1, 100), 1)
            .await
            .unwrap();

        // cached revoke wins over the stale row
        f.cache
            .put_both(Domain::Favorite, PairKey::new(1, 100), CacheValue::new(2, ActionType::Revoke))
            .await
            .unwrap();
        assert!(!f.service.is_favorited(1, 100).await.unwrap());

        f.raw.clear().await;
        assert!(f.service.is_favorited(1, 100).await.unwrap());
    }

    #[tokio::test]
    async fn test_undecodable_read_view_falls_back_to_store() {
        let f = fixture();
        f.raw
            .set("user::1::to_user::2::r", "junk", None)
            .await
            .unwrap();
        assert!(!f.service.is_following(1, 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_lists_come_from_store() {
        let f = fixture();
        for id in 1..=3 {
            f.store.insert_user(id).unwrap();
        }
        f.store.insert_relation_raw(Domain::Relation, PairKey::new(1, 2), 10).unwrap();
        f.store.insert_relation_raw(Domain::Relation, PairKey::new(1, 3), 20).unwrap();
        f.store.insert_relation_raw(Domain::Relation, PairKey::new(2, 1), 30).unwrap();

        assert_eq!(f.service.follow_list(1).await.unwrap(), vec![3, 2]);
        assert_eq!(f.service.follower_list(1).await.unwrap(), vec![2]);
        assert_eq!(f.service.friend_list(1).await.unwrap(), vec![2]);
        assert!(f.service.favorite_list(1).await.unwrap().is_empty());
    }
}
