//! Redis-backed cache store.

use super::traits::{CacheStore, CacheWrite};
use crate::connection::{cache_op_error, RedisConfig};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tally_core::{CacheError, TallyResult};

/// Cache store over a shared [`ConnectionManager`].
///
/// Key enumeration uses cursor-based `SCAN`, never `KEYS`.
#[derive(Clone)]
pub struct RedisCacheStore {
    conn: ConnectionManager,
    scan_count: usize,
}

impl RedisCacheStore {
    pub fn new(conn: ConnectionManager, scan_count: usize) -> Self {
        Self {
            conn,
            scan_count: scan_count.max(1),
        }
    }

    pub async fn connect(config: &RedisConfig) -> TallyResult<Self> {
        let conn = config.connect().await?;
        Ok(Self::new(conn, config.scan_count))
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by the server
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> TallyResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(cache_op_error("GET"))?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> TallyResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd
            .query_async(&mut conn)
            .await
            .map_err(cache_op_error("SET"))?;
        Ok(())
    }

    async fn set_many(&self, writes: &[CacheWrite]) -> TallyResult<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for write in writes {
            let cmd = pipe.cmd("SET").arg(&write.key).arg(&write.value);
            if let Some(ttl) = write.ttl {
                cmd.arg("PX").arg(ttl_millis(ttl));
            }
            cmd.ignore();
        }
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(cache_op_error("MULTI SET"))?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> TallyResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(cache_op_error("DEL"))?;
        Ok(removed)
    }

    async fn scan(&self, pattern: &str) -> TallyResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(self.scan_count)
                .query_async(&mut conn)
                .await
                .map_err(cache_op_error("SCAN"))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once across a rehash
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn ping(&self) -> TallyResult<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Unavailable {
                reason: e.to_string(),
            })?;
        if pong != "PONG" {
            return Err(CacheError::Unavailable {
                reason: format!("unexpected PING reply {:?}", pong),
            }
            .into());
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis_tests_enabled() -> bool {
        std::env::var("REDIS_TESTS").map(|v| v == "1").unwrap_or(false)
    }

    #[test]
    fn test_ttl_millis_floor() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(6)), 6_000);
    }

    #[tokio::test]
    async fn test_redis_roundtrip() {
        if !redis_tests_enabled() {
            return;
        }
        let store = RedisCacheStore::connect(&RedisConfig::from_env())
            .await
            .unwrap();
        store.ping().await.unwrap();

        let key = format!("tally:test:{}::w", std::process::id());
        store.set(&key, "10::1", None).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some("10::1".to_string()));

        let found = store.scan(&format!("tally:test:{}::*", std::process::id())).await.unwrap();
        assert!(found.contains(&key));

        assert_eq!(store.delete(&[key.clone()]).await.unwrap(), 1);
        assert_eq!(store.get(&key).await.unwrap(), None);
    }
}
