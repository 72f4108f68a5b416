//! Error types for Tally operations

use crate::Domain;
use std::time::Duration;
use thiserror::Error;

/// Cache store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache backend unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Cache operation {operation} failed: {reason}")]
    OperationFailed { operation: String, reason: String },
}

/// Lock manager errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("Timed out after {waited:?} acquiring lock {name}")]
    Timeout { name: String, waited: Duration },

    #[error("Lock backend failed for {name}: {reason}")]
    Backend { name: String, reason: String },

    #[error("Lock {name} was no longer held at release")]
    NotHeld { name: String },
}

/// Action queue errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue {queue} unavailable: {reason}")]
    Unavailable { queue: String, reason: String },

    #[error("Publish to {queue} failed: {reason}")]
    PublishFailed { queue: String, reason: String },

    #[error("Acknowledgement on {queue} failed for {tag}: {reason}")]
    AckFailed {
        queue: String,
        tag: String,
        reason: String,
    },

    #[error("Queue {queue} is closed")]
    Closed { queue: String },
}

/// Source-of-truth store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage connection failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Query failed: {reason}")]
    QueryFailed { reason: String },

    #[error("Transaction failed for {domain} ({actor_id} -> {target_id}): {reason}")]
    TransactionFailed {
        domain: Domain,
        actor_id: i64,
        target_id: i64,
        reason: String,
    },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Decode errors for queue payloads, cache keys and cache values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed event payload: {reason}")]
    Payload { reason: String },

    #[error("Malformed cache key {key:?}")]
    CacheKey { key: String },

    #[error("Malformed cache value {value:?}")]
    CacheValue { value: String },
}

/// Validation errors raised at the producing boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid action type {value}: expected 1 (apply) or 2 (revoke)")]
    InvalidActionType { value: i64 },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all Tally errors.
#[derive(Debug, Clone, Error)]
pub enum TallyError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl TallyError {
    /// Whether retrying the same operation later can succeed.
    ///
    /// Infrastructure failures are transient; malformed input and invalid
    /// configuration are not.
    pub fn is_transient(&self) -> bool {
        match self {
            TallyError::Cache(_) | TallyError::Lock(_) | TallyError::Storage(_) => true,
            TallyError::Queue(QueueError::Closed { .. }) => false,
            TallyError::Queue(_) => true,
            TallyError::Decode(_) | TallyError::Validation(_) | TallyError::Config(_) => false,
        }
    }
}

/// Result type alias for Tally operations.
pub type TallyResult<T> = Result<T, TallyError>;

// =============================================================================
// TESTS
// =============================================================================
