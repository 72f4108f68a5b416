//! In-memory relation store for tests and single-process runs.

use super::traits::RelationStore;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tally_core::{Domain, PairKey, StorageError, TallyResult};

/// Counter columns of a user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserCounters {
    pub following_count: i64,
    pub follower_count: i64,
    pub favorite_count: i64,
    pub total_favorited: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoRow {
    pub author_id: i64,
    pub favorite_count: i64,
}

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<i64, UserCounters>,
    videos: HashMap<i64, VideoRow>,
    favorites: BTreeMap<PairKey, i64>,
    follows: BTreeMap<PairKey, i64>,
}

impl Tables {
    fn rows(&self, domain: Domain) -> &BTreeMap<PairKey, i64> {
        match domain {
            Domain::Favorite => &self.favorites,
            Domain::Relation => &self.follows,
        }
    }

    fn rows_mut(&mut self, domain: Domain) -> &mut BTreeMap<PairKey, i64> {
        match domain {
            Domain::Favorite => &mut self.favorites,
            Domain::Relation => &mut self.follows,
        }
    }
}

/// Relation store over in-process maps.
///
/// Transactions validate every step before mutating anything, so a failed
/// apply or revoke leaves all tables untouched.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRelationStore {
    tables: Arc<RwLock<Tables>>,
    committed: Arc<AtomicU64>,
    fail_transactions: Arc<AtomicBool>,
}

impl InMemoryRelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, StorageError> {
        self.tables.read().map_err(|_| StorageError::LockPoisoned)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, StorageError> {
        self.tables.write().map_err(|_| StorageError::LockPoisoned)
    }

    // === Seeding ===

    pub fn insert_user(&self, id: i64) -> TallyResult<()> {
        self.write()?.users.entry(id).or_default();
        Ok(())
    }

    pub fn insert_video(&self, id: i64, author_id: i64) -> TallyResult<()> {
        self.write()?.videos.insert(
            id,
            VideoRow {
                author_id,
                favorite_count: 0,
            },
        );
        Ok(())
    }

    /// Remove a user row. Relation rows referencing it are left in place.
    pub fn delete_user(&self, id: i64) -> TallyResult<()> {
        self.write()?.users.remove(&id);
        Ok(())
    }

    pub fn delete_video(&self, id: i64) -> TallyResult<()> {
        self.write()?.videos.remove(&id);
        Ok(())
    }

    /// Insert a relation row and bump counters directly, bypassing the
    /// transactional path. Models rows created out-of-band.
    pub fn insert_relation_raw(&self, domain: Domain, pair: PairKey, created_at: i64) -> TallyResult<()> {
        let mut tables = self.write()?;
        if tables.rows_mut(domain).insert(pair, created_at).is_some() {
            return Ok(());
        }
        adjust_counters(&mut *tables, domain, pair, 1);
        Ok(())
    }

    /// Make every following apply/revoke fail without mutating.
    pub fn set_fail_transactions(&self, fail: bool) {
        self.fail_transactions.store(fail, Ordering::SeqCst);
    }

    // === Inspection ===

    pub fn user_counters(&self, id: i64) -> Option<UserCounters> {
        self.read().ok()?.users.get(&id).copied()
    }

    pub fn video(&self, id: i64) -> Option<VideoRow> {
        self.read().ok()?.videos.get(&id).copied()
    }

    pub fn relation_created_at(&self, domain: Domain, pair: PairKey) -> Option<i64> {
        self.read().ok()?.rows(domain).get(&pair).copied()
    }

    pub fn relation_count(&self, domain: Domain) -> usize {
        self.read().map(|t| t.rows(domain).len()).unwrap_or(0)
    }

    /// Number of committed apply/revoke transactions.
    pub fn committed_transactions(&self) -> u64 {
        self.committed.load(Ordering::SeqCst)
    }

    /// Check every counter against a recount of the relation rows.
    ///
    /// Returns a description of each mismatch; empty when consistent.
    pub fn counter_mismatches(&self) -> Vec<String> {
        let Ok(tables) = self.read() else {
            return vec!["tables poisoned".to_string()];
        };
        let mut expected_users: HashMap<i64, UserCounters> = HashMap::new();
        let mut expected_videos: HashMap<i64, i64> = HashMap::new();

        for pair in tables.favorites.keys() {
            expected_users.entry(pair.actor_id).or_default().favorite_count += 1;
            *expected_videos.entry(pair.target_id).or_default() += 1;
            if let Some(video) = tables.videos.get(&pair.target_id) {
                expected_users.entry(video.author_id).or_default().total_favorited += 1;
            }
        }
        for pair in tables.follows.keys() {
            expected_users.entry(pair.actor_id).or_default().following_count += 1;
            expected_users.entry(pair.target_id).or_default().follower_count += 1;
        }

        let mut mismatches = Vec::new();
        for (id, actual) in &tables.users {
            let expected = expected_users.get(id).copied().unwrap_or_default();
            if *actual != expected {
                mismatches.push(format!("user {}: {:?} != {:?}", id, actual, expected));
            }
        }
        for (id, video) in &tables.videos {
            let expected = expected_videos.get(id).copied().unwrap_or(0);
            if video.favorite_count != expected {
                mismatches.push(format!(
                    "video {}: favorite_count {} != {}",
                    id, video.favorite_count, expected
                ));
            }
        }
        mismatches
    }

    fn entities_exist_in(tables: &Tables, domain: Domain, pair: PairKey) -> bool {
        match domain {
            Domain::Favorite => {
                tables.users.contains_key(&pair.actor_id)
                    && tables
                        .videos
                        .get(&pair.target_id)
                        .is_some_and(|video| tables.users.contains_key(&video.author_id))
            }
            Domain::Relation => {
                tables.users.contains_key(&pair.actor_id) && tables.users.contains_key(&pair.target_id)
            }
        }
    }

    /// Every entity the counters of `pair` touch, or the first one missing.
    fn check_counter_rows(tables: &Tables, domain: Domain, pair: PairKey) -> Result<(), String> {
        if !tables.users.contains_key(&pair.actor_id) {
            return Err(format!("user {} not found", pair.actor_id));
        }
        match domain {
            Domain::Favorite => {
                let video = tables
                    .videos
                    .get(&pair.target_id)
                    .ok_or_else(|| format!("video {} not found", pair.target_id))?;
                if !tables.users.contains_key(&video.author_id) {
                    return Err(format!("author {} not found", video.author_id));
                }
            }
            Domain::Relation => {
                if !tables.users.contains_key(&pair.target_id) {
                    return Err(format!("user {} not found", pair.target_id));
                }
            }
        }
        Ok(())
    }

    fn transaction(
        &self,
        domain: Domain,
        pair: PairKey,
        step: impl FnOnce(&mut Tables) -> Result<(), String>,
    ) -> TallyResult<()> {
        let failed = |reason: String| StorageError::TransactionFailed {
            domain,
            actor_id: pair.actor_id,
            target_id: pair.target_id,
            reason,
        };
        if self.fail_transactions.load(Ordering::SeqCst) {
            return Err(failed("injected failure".to_string()).into());
        }
        let mut tables = self.write()?;
        step(&mut *tables).map_err(failed)?;
        self.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn adjust_counters(tables: &mut Tables, domain: Domain, pair: PairKey, delta: i64) {
    match domain {
        Domain::Favorite => {
            let author = tables.videos.get_mut(&pair.target_id).map(|video| {
                video.favorite_count += delta;
                video.author_id
            });
            if let Some(actor) = tables.users.get_mut(&pair.actor_id) {
                actor.favorite_count += delta;
            }
            if let Some(author) = author.and_then(|id| tables.users.get_mut(&id)) {
                author.total_favorited += delta;
            }
        }
        Domain::Relation => {
            if let Some(actor) = tables.users.get_mut(&pair.actor_id) {
                actor.following_count += delta;
            }
            if let Some(target) = tables.users.get_mut(&pair.target_id) {
                target.follower_count += delta;
            }
        }
    }
}

fn newest_first(mut rows: Vec<(i64, i64)>) -> Vec<i64> {
    // (id, created_at)
    rows.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    rows.into_iter().map(|(id, _)| id).collect()
}

#[async_trait]
impl RelationStore for InMemoryRelationStore {
    async fn entities_exist(&self, domain: Domain, pair: PairKey) -> TallyResult<bool> {
        let tables = self.read()?;
        Ok(Self::entities_exist_in(&tables, domain, pair))
    }

    async fn relation_exists(&self, domain: Domain, pair: PairKey) -> TallyResult<bool> {
        Ok(self.read()?.rows(domain).contains_key(&pair))
    }

    async fn apply_relation(&self, domain: Domain, pair: PairKey, created_at: i64) -> TallyResult<()> {
        self.transaction(domain, pair, |tables| {
            if tables.rows(domain).contains_key(&pair) {
                return Err("relation row already exists".to_string());
            }
            Self::check_counter_rows(tables, domain, pair)?;
            tables.rows_mut(domain).insert(pair, created_at);
            adjust_counters(tables, domain, pair, 1);
            Ok(())
        })
    }

    async fn revoke_relation(&self, domain: Domain, pair: PairKey) -> TallyResult<()> {
        self.transaction(domain, pair, |tables| {
            if !tables.rows(domain).contains_key(&pair) {
                return Err("relation row not found".to_string());
            }
            Self::check_counter_rows(tables, domain, pair)?;
            tables.rows_mut(domain).remove(&pair);
            adjust_counters(tables, domain, pair, -1);
            Ok(())
        })
    }

    async fn list_targets(&self, domain: Domain, actor_id: i64) -> TallyResult<Vec<i64>> {
        let tables = self.read()?;
        let rows = tables
            .rows(domain)
            .iter()
            .filter(|(pair, _)| pair.actor_id == actor_id)
            .map(|(pair, at)| (pair.target_id, *at))
            .collect();
        Ok(newest_first(rows))
    }

    async fn list_actors(&self, domain: Domain, target_id: i64) -> TallyResult<Vec<i64>> {
        let tables = self.read()?;
        let rows = tables
            .rows(domain)
            .iter()
            .filter(|(pair, _)| pair.target_id == target_id)
            .map(|(pair, at)| (pair.actor_id, *at))
            .collect();
        Ok(newest_first(rows))
    }

    async fn list_friends(&self, user_id: i64) -> TallyResult<Vec<i64>> {
        let tables = self.read()?;
        let rows = tables
            .follows
            .iter()
            .filter(|(pair, _)| pair.actor_id == user_id)
            .filter(|(pair, _)| {
                tables
                    .follows
                    .contains_key(&PairKey::new(pair.target_id, user_id))
            })
            .map(|(pair, at)| (pair.target_id, *at))
            .collect();
        Ok(newest_first(rows))
    }

    async fn ping(&self) -> TallyResult<()> {
        self.read()?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::TallyError;

    fn seeded() -> InMemoryRelationStore {
        let store = InMemoryRelationStore::new();
        for id in 1..=4 {
            store.insert_user(id).unwrap();
        }
        store.insert_video(100, 4).unwrap();
        store
    }

    #[tokio::test]
    async fn test_apply_favorite_updates_three_counters() {
        let store = seeded();
        let pair = PairKey::new(1, 100);
        store.apply_relation(Domain::Favorite, pair, 10).await.unwrap();

        assert!(store.relation_exists(Domain::Favorite, pair).await.unwrap());
        assert_eq!(store.video(100).unwrap().favorite_count, 1);
        assert_eq!(store.user_counters(1).unwrap().favorite_count, 1);
        assert_eq!(store.user_counters(4).unwrap().total_favorited, 1);
        assert!(store.counter_mismatches().is_empty());
    }

    #[tokio::test]
    async fn test_follow_and_unfollow() {
        let store = seeded();
        let pair = PairKey::new(1, 2);
        store.apply_relation(Domain::Relation, pair, 1).await.unwrap();
        assert_eq!(store.user_counters(1).unwrap().following_count, 1);
        assert_eq!(store.user_counters(2).unwrap().follower_count, 1);

        store.revoke_relation(Domain::Relation, pair).await.unwrap();
        assert_eq!(store.user_counters(1).unwrap(), UserCounters::default());
        assert_eq!(store.user_counters(2).unwrap(), UserCounters::default());
        assert_eq!(store.committed_transactions(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_apply_fails_without_mutation() {
        let store = seeded();
        let pair = PairKey::new(1, 2);
        store.apply_relation(Domain::Relation, pair, 1).await.unwrap();
        let err = store.apply_relation(Domain::Relation, pair, 2).await.unwrap_err();
        assert!(matches!(
            err,
            TallyError::Storage(StorageError::TransactionFailed { .. })
        ));
        assert_eq!(store.user_counters(1).unwrap().following_count, 1);
        assert_eq!(store.relation_created_at(Domain::Relation, pair), Some(1));
    }

    #[tokio::test]
    async fn test_missing_author_aborts_whole_transaction() {
        let store = seeded();
        store.delete_user(4).unwrap();
        let pair = PairKey::new(1, 100);

        assert!(store.apply_relation(Domain::Favorite, pair, 1).await.is_err());
        assert!(!store.relation_exists(Domain::Favorite, pair).await.unwrap());
        assert_eq!(store.video(100).unwrap().favorite_count, 0);
        assert_eq!(store.user_counters(1).unwrap().favorite_count, 0);
        assert_eq!(store.committed_transactions(), 0);
    }

    #[tokio::test]
    async fn test_entities_exist() {
        let store = seeded();
        assert!(store.entities_exist(Domain::Favorite, PairKey::new(1, 100)).await.unwrap());
        assert!(!store.entities_exist(Domain::Favorite, PairKey::new(1, 101)).await.unwrap());
        assert!(!store.entities_exist(Domain::Relation, PairKey::new(1, 9)).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_author_means_favorite_entities_gone() {
        let store = seeded();
        store.delete_user(4).unwrap();
        assert!(!store.entities_exist(Domain::Favorite, PairKey::new(1, 100)).await.unwrap());
    }

    #[tokio::test]
    async fn test_raw_insert_keeps_counters_consistent() {
        let store = seeded();
        store
            .insert_relation_raw(Domain::Relation, PairKey::new(3, 1), 5)
            .unwrap();
        assert_eq!(store.user_counters(1).unwrap().follower_count, 1);
        assert!(store.counter_mismatches().is_empty());
        assert_eq!(store.committed_transactions(), 0);
    }

    #[tokio::test]
    async fn test_lists() {
        let store = seeded();
        store.apply_relation(Domain::Relation, PairKey::new(1, 2), 1).await.unwrap();
        store.apply_relation(Domain::Relation, PairKey::new(1, 3), 2).await.unwrap();
        store.apply_relation(Domain::Relation, PairKey::new(2, 1), 3).await.unwrap();
        store.apply_relation(Domain::Favorite, PairKey::new(2, 100), 4).await.unwrap();

        assert_eq!(store.list_targets(Domain::Relation, 1).await.unwrap(), vec![3, 2]);
        assert_eq!(store.list_actors(Domain::Relation, 1).await.unwrap(), vec![2]);
        assert_eq!(store.list_friends(1).await.unwrap(), vec![2]);
        assert_eq!(store.list_friends(3).await.unwrap(), Vec::<i64>::new());
        assert_eq!(store.list_targets(Domain::Favorite, 2).await.unwrap(), vec![100]);
        assert_eq!(store.list_actors(Domain::Favorite, 100).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = seeded();
        store.set_fail_transactions(true);
        assert!(store
            .apply_relation(Domain::Relation, PairKey::new(1, 2), 1)
            .await
            .is_err());
        store.set_fail_transactions(false);
        store
            .apply_relation(Domain::Relation, PairKey::new(1, 2), 1)
            .await
            .unwrap();
    }
}
