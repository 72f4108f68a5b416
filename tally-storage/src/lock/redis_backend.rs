//! Redis lock backend: `SET NX PX` to acquire, token-checked delete to
//! release.

use super::backend::LockBackend;
use crate::connection::RedisConfig;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;
use tally_core::{LockError, TallyResult};

/// Deletes the key only if it still holds our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisLockBackend {
    conn: ConnectionManager,
    release_script: Script,
}

impl RedisLockBackend {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }

    pub async fn connect(config: &RedisConfig) -> TallyResult<Self> {
        Ok(Self::new(config.connect().await?))
    }
}

fn backend_error(name: &str) -> impl Fn(redis::RedisError) -> LockError + '_ {
    move |e| LockError::Backend {
        name: name.to_string(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn try_acquire(&self, name: &str, token: &str, lease: Duration) -> TallyResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg((lease.as_millis() as u64).max(1))
            .query_async(&mut conn)
            .await
            .map_err(backend_error(name))?;
        Ok(reply.is_some())
    }

    async fn release(&self, name: &str, token: &str) -> TallyResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release_script
            .key(name)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_error(name))?;
        Ok(deleted == 1)
    }

    async fn ping(&self) -> TallyResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(backend_error("ping"))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
