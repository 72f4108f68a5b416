//! Connection setup for the Redis and PostgreSQL backends.

use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use redis::aio::ConnectionManager;
use redis::Client;
use std::time::Duration;
use tally_core::{CacheError, StorageError, TallyResult};
use tokio_postgres::NoTls;

// ============================================================================
// REDIS
// ============================================================================

/// Redis connection configuration of the cache and lock backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub url: String,
    /// `COUNT` hint passed to `SCAN`.
    pub scan_count: usize,
    pub connection_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            scan_count: 500,
            connection_timeout: Duration::from_secs(2),
        }
    }
}

impl RedisConfig {
    /// Environment variables:
    /// - `TALLY_REDIS_URL` (default: redis://127.0.0.1:6379)
    /// - `TALLY_REDIS_SCAN_COUNT` (default: 500)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("TALLY_REDIS_URL").unwrap_or(defaults.url),
            scan_count: std::env::var("TALLY_REDIS_SCAN_COUNT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.scan_count),
            connection_timeout: defaults.connection_timeout,
        }
    }

    /// Open a reconnecting connection manager.
    pub async fn connect(&self) -> TallyResult<ConnectionManager> {
        let unavailable = |e: redis::RedisError| CacheError::Unavailable {
            reason: e.to_string(),
        };

        let client = Client::open(self.url.as_str()).map_err(unavailable)?;
        let manager = tokio::time::timeout(self.connection_timeout, client.get_connection_manager())
            .await
            .map_err(|_| CacheError::Unavailable {
                reason: format!("connection to {} timed out", self.url),
            })?
            .map_err(unavailable)?;
        Ok(manager)
    }
}

/// Map a Redis error from a cache command.
pub(crate) fn cache_op_error(operation: &str) -> impl Fn(redis::RedisError) -> CacheError + '_ {
    move |e| CacheError::OperationFailed {
        operation: operation.to_string(),
        reason: e.to_string(),
    }
}

// ============================================================================
// POSTGRES
// ============================================================================

/// PostgreSQL connection pool configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Wait, create and recycle timeout
    pub timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "tally".to_string(),
            user: "postgres".to_string(),
            password: "".to_string(),
            max_size: 16,
            timeout: Duration::from_secs(30),
        }
    }
}

impl DbConfig {
    /// Create a new database configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("TALLY_DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("TALLY_DB_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5432),
            dbname: std::env::var("TALLY_DB_NAME").unwrap_or_else(|_| "tally".to_string()),
            user: std::env::var("TALLY_DB_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: std::env::var("TALLY_DB_PASSWORD").unwrap_or_default(),
            max_size: std::env::var("TALLY_DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(16),
            timeout: Duration::from_secs(
                std::env::var("TALLY_DB_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }

    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> TallyResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: self.max_size,
            timeouts: deadpool_postgres::Timeouts::wait_millis(self.timeout.as_millis() as u64),
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StorageError::ConnectionFailed {
                reason: format!("Failed to create pool: {}", e),
            })?;

        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_defaults() {
        let config = RedisConfig::default();
        assert_eq!(config.url, "redis://127.0.0.1:6379");
        assert_eq!(config.scan_count, 500);
    }

    #[test]
    fn test_db_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.port, 5432);
        assert_eq!(config.dbname, "tally");
        assert_eq!(config.max_size, 16);
    }

    #[test]
    fn test_create_pool_is_lazy() {
        // deadpool does not connect until the first checkout
        assert!(DbConfig::default().create_pool().is_ok());
    }
}
