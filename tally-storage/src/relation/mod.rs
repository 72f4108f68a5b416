//! Source-of-truth relation rows and counters.

mod memory;
mod postgres;
mod traits;

pub use memory::{InMemoryRelationStore, UserCounters, VideoRow};
pub use postgres::PgRelationStore;
pub use traits::RelationStore;
