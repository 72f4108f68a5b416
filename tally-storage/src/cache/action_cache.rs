//! Typed access to the read and write views.

use super::traits::{CacheStore, CacheWrite};
use std::sync::Arc;
use std::time::Duration;
use tally_core::{CacheKey, CacheValue, Domain, PairKey, TallyResult, View};

/// Read/write-view facade over a raw [`CacheStore`].
///
/// The read view carries the configured TTL; the write view never expires
/// and is only removed by the sweeper.
#[derive(Clone)]
pub struct ActionCache {
    store: Arc<dyn CacheStore>,
    read_ttl: Duration,
}

impl ActionCache {
    pub fn new(store: Arc<dyn CacheStore>, read_ttl: Duration) -> Self {
        Self { store, read_ttl }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn read_ttl(&self) -> Duration {
        self.read_ttl
    }

    async fn load(&self, key: CacheKey) -> TallyResult<Option<CacheValue>> {
        match self.store.get(&key.to_string()).await? {
            Some(raw) => Ok(Some(CacheValue::decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Short-lived view used by live reads.
    pub async fn read_view(&self, domain: Domain, pair: PairKey) -> TallyResult<Option<CacheValue>> {
        self.load(CacheKey::read(domain, pair)).await
    }

    /// Durable view awaiting migration.
    pub async fn write_view(
        &self,
        domain: Domain,
        pair: PairKey,
    ) -> TallyResult<Option<CacheValue>> {
        self.load(CacheKey::write(domain, pair)).await
    }

    /// Record `value` in both views.
    pub async fn put_both(&self, domain: Domain, pair: PairKey, value: CacheValue) -> TallyResult<()> {
        let encoded = value.encode();
        let writes = [
            CacheWrite::new(
                CacheKey::read(domain, pair).to_string(),
                encoded.clone(),
                Some(self.read_ttl),
            ),
            CacheWrite::new(CacheKey::write(domain, pair).to_string(), encoded, None),
        ];
        self.store.set_many(&writes).await
    }

    /// Delete both views of a pair.
    pub async fn remove(&self, domain: Domain, pair: PairKey) -> TallyResult<u64> {
        let keys = [View::Read, View::Write]
            .into_iter()
            .map(|view| CacheKey::new(domain, pair, view).to_string())
            .collect::<Vec<_>>();
        self.store.delete(&keys).await
    }

    /// Every pending write-view key of a domain.
    ///
    /// Keys that match the pattern but do not parse are skipped with a
    /// warning; they are not ours to delete.
    pub async fn pending_keys(&self, domain: Domain) -> TallyResult<Vec<CacheKey>> {
        let raw = self.store.scan(CacheKey::write_pattern(domain)).await?;
        let mut keys = Vec::with_capacity(raw.len());
        for key in raw {
            match CacheKey::parse(&key) {
                Ok(parsed) if parsed.domain == domain && parsed.view == View::Write => {
                    keys.push(parsed)
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping unparsable cache key");
                }
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheStore;
    use tally_core::{ActionType, TallyError};

    fn cache() -> (InMemoryCacheStore, ActionCache) {
        let store = InMemoryCacheStore::new();
        let cache = ActionCache::new(Arc::new(store.clone()), Duration::from_secs(6));
        (store, cache)
    }

    #[tokio::test]
    async fn test_put_both_sets_views_with_expected_ttls() {
        let (store, cache) = cache();
        let pair = PairKey::new(3, 100);
        let value = CacheValue::new(42, ActionType::Apply);
        cache.put_both(Domain::Favorite, pair, value).await.unwrap();

        assert_eq!(cache.read_view(Domain::Favorite, pair).await.unwrap(), Some(value));
        assert_eq!(cache.write_view(Domain::Favorite, pair).await.unwrap(), Some(value));
        assert_eq!(
            store.get("video::100::user::3::w").await.unwrap(),
            Some("42::1".to_string())
        );
        assert_eq!(store.ttl("video::100::user::3::w").await, Some(None));
        assert!(matches!(store.ttl("video::100::user::3::r").await, Some(Some(_))));
    }

    #[tokio::test]
    async fn test_remove_clears_both_views() {
        let (_, cache) = cache();
        let pair = PairKey::new(1, 2);
        cache
            .put_both(Domain::Relation, pair, CacheValue::new(1, ActionType::Revoke))
            .await
            .unwrap();
        assert_eq!(cache.remove(Domain::Relation, pair).await.unwrap(), 2);
        assert_eq!(cache.write_view(Domain::Relation, pair).await.unwrap(), None);
        assert_eq!(cache.read_view(Domain::Relation, pair).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pending_keys_is_domain_scoped() {
        let (store, cache) = cache();
        let value = CacheValue::new(1, ActionType::Apply);
        cache.put_both(Domain::Favorite, PairKey::new(1, 10), value).await.unwrap();
        cache.put_both(Domain::Favorite, PairKey::new(2, 10), value).await.unwrap();
        cache.put_both(Domain::Relation, PairKey::new(1, 2), value).await.unwrap();
        store.set("video::x::user::1::w", "1::1", None).await.unwrap();

        let mut favorites = cache.pending_keys(Domain::Favorite).await.unwrap();
        favorites.sort_by_key(|k| k.pair);
        assert_eq!(
            favorites,
            vec![
                CacheKey::write(Domain::Favorite, PairKey::new(1, 10)),
                CacheKey::write(Domain::Favorite, PairKey::new(2, 10)),
            ]
        );
        assert_eq!(cache.pending_keys(Domain::Relation).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_value_is_decode_error() {
        let (store, cache) = cache();
        store.set("user::1::to_user::2::w", "garbage", None).await.unwrap();
        let err = cache
            .write_view(Domain::Relation, PairKey::new(1, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, TallyError::Decode(_)));
    }
}
