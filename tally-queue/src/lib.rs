//! Tally Queue - Action Queues
//!
//! One named queue per domain carries JSON-encoded action events from the
//! producing boundary to the reconciler. Delivery is at-least-once in
//! manual ack mode; a message lost by the broker before reconciliation is
//! lost for good.

pub mod config;
pub mod memory;
pub mod redis_stream;
pub mod traits;

pub use config::QueueConfig;
pub use memory::InMemoryQueue;
pub use redis_stream::RedisStreamQueue;
pub use tally_core::AckMode;
pub use traits::{ActionQueue, Delivery};
