//! Tally Core - Domain Types
//!
//! Events, cache key/value codecs, the last-writer-wins and sweep decision
//! rules, configuration and the error taxonomy. No I/O lives here; every
//! other crate depends on this one.

pub mod cache_key;
pub mod config;
pub mod constants;
pub mod decision;
pub mod domain;
pub mod error;
pub mod event;

pub use cache_key::{CacheKey, CacheValue, View};
pub use config::{AckMode, EngineConfig, LockConfig, LockGranularity};
pub use decision::{reconcile, sweep_decision, ReconcileDecision, SweepAction};
pub use domain::{ActionType, Domain};
pub use error::{
    CacheError, ConfigError, DecodeError, LockError, QueueError, StorageError, TallyError,
    TallyResult, ValidationError,
};
pub use event::{ActionEvent, EventClock, PairKey};
