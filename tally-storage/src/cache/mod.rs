//! Cache store for the read and write views.
//!
//! - [`CacheStore`]: raw string key-value contract
//! - [`InMemoryCacheStore`] / [`RedisCacheStore`]: backends
//! - [`ActionCache`]: typed read/write-view access used by the engine

mod action_cache;
mod memory;
mod redis_backend;
mod traits;

pub use action_cache::ActionCache;
pub use memory::{glob_match, InMemoryCacheStore};
pub use redis_backend::RedisCacheStore;
pub use traits::{CacheStore, CacheWrite};
