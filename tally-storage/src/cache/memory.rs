//! In-memory cache store with per-entry TTL.

use super::traits::{CacheStore, CacheWrite};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tally_core::TallyResult;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// TTL-aware map. Expired entries are invisible to reads and purged on the
/// next scan.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCacheStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remaining TTL of a live entry; `Some(None)` for entries without TTL.
    pub async fn ttl(&self, key: &str) -> Option<Option<Duration>> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        let entry = entries.get(key).filter(|e| e.is_live(now))?;
        Some(entry.expires_at.map(|at| at - now))
    }

    /// Drop everything.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    fn purge_expired(entries: &mut HashMap<String, Entry>, now: Instant) {
        entries.retain(|_, e| e.is_live(now));
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> TallyResult<Option<String>> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> TallyResult<()> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(())
    }

    async fn set_many(&self, writes: &[CacheWrite]) -> TallyResult<()> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        for write in writes {
            entries.insert(
                write.key.clone(),
                Entry {
                    value: write.value.clone(),
                    expires_at: write.ttl.map(|t| now + t),
                },
            );
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> TallyResult<u64> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = entries.remove(key) {
                if entry.is_live(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn scan(&self, pattern: &str) -> TallyResult<Vec<String>> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        Self::purge_expired(&mut entries, now);
        Ok(entries
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> TallyResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Match `text` against a pattern where `*` matches any run of characters.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or("");
    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };

    let tail: Vec<&str> = parts.collect();
    let Some((last, middle)) = tail.split_last() else {
        // no wildcard at all
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("video::*::user::*::w", "video::1::user::2::w"));
        assert!(glob_match("video::*::user::*::w", "video::10::user::-3::w"));
        assert!(!glob_match("video::*::user::*::w", "video::1::user::2::r"));
        assert!(!glob_match("video::*::user::*::w", "user::1::to_user::2::w"));
        assert!(glob_match("*", ""));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
        assert!(glob_match("a*a", "aa"));
        assert!(!glob_match("ab*ba", "aba"));
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = InMemoryCacheStore::new();
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        let removed = store
            .delete(&["k".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_purged_by_scan_not_by_writes() {
        let store = InMemoryCacheStore::new();
        store.set("old", "1", Some(Duration::from_secs(1))).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        store.set("new", "2", None).await.unwrap();
        assert_eq!(store.entries.read().await.len(), 2);
        assert_eq!(store.get("old").await.unwrap(), None);

        assert_eq!(store.scan("*").await.unwrap(), vec!["new".to_string()]);
        assert_eq!(store.entries.read().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = InMemoryCacheStore::new();
        store
            .set("short", "1", Some(Duration::from_secs(6)))
            .await
            .unwrap();
        store.set("durable", "2", None).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(store.get("short").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("short").await.unwrap().is_none());
        assert!(store.get("durable").await.unwrap().is_some());
        assert_eq!(store.scan("*").await.unwrap(), vec!["durable".to_string()]);
    }

    #[tokio::test]
    async fn test_set_replaces_ttl() {
        let store = InMemoryCacheStore::new();
        store
            .set("k", "1", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        store.set("k", "2", None).await.unwrap();
        assert_eq!(store.ttl("k").await, Some(None));
    }

    #[tokio::test]
    async fn test_scan_pattern() {
        let store = InMemoryCacheStore::new();
        let writes = vec![
            CacheWrite::new("video::1::user::2::r", "a", Some(Duration::from_secs(6))),
            CacheWrite::new("video::1::user::2::w", "a", None),
            CacheWrite::new("user::2::to_user::3::w", "b", None),
        ];
        store.set_many(&writes).await.unwrap();

        let favorites = store.scan("video::*::user::*::w").await.unwrap();
        assert_eq!(favorites, vec!["video::1::user::2::w".to_string()]);
        assert_eq!(store.len().await, 3);
    }
}
