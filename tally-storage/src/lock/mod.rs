//! Distributed mutual exclusion for cache mutations and sweeps.

mod backend;
mod manager;
mod redis_backend;

pub use backend::{InMemoryLockBackend, LockBackend};
pub use manager::{LockGuard, LockManager};
pub use redis_backend::RedisLockBackend;
