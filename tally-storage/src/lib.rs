//! Tally Storage - Cache, Lock and Relation Store Backends
//!
//! Each concern is a trait with an in-memory implementation (tests, single
//! process) and a networked one: Redis for the cache and locks, PostgreSQL
//! for relation rows and counters.

pub mod cache;
pub mod connection;
pub mod lock;
pub mod relation;

pub use cache::{ActionCache, CacheStore, CacheWrite, InMemoryCacheStore, RedisCacheStore};
pub use connection::{DbConfig, RedisConfig};
pub use lock::{InMemoryLockBackend, LockBackend, LockGuard, LockManager, RedisLockBackend};
pub use relation::{
    InMemoryRelationStore, PgRelationStore, RelationStore, UserCounters, VideoRow,
};
