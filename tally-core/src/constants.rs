//! Constants for Tally
//!
//! Default values used by the configuration structs. Centralizing them keeps
//! the `Default` impls, the `from_env` fallbacks and the tests in agreement.

// ============================================================================
// CACHE
// ============================================================================

/// Read-view TTL in milliseconds (6 seconds)
pub const DEFAULT_READ_TTL_MS: u64 = 6_000;

// ============================================================================
// SWEEPER
// ============================================================================

/// Sweep interval per domain in seconds
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10;

// ============================================================================
// LOCKS
// ============================================================================

/// Lock lease in milliseconds. Longer than one critical section, short enough
/// that a crashed holder does not stall a domain for long.
pub const DEFAULT_LOCK_LEASE_MS: u64 = 8_000;

/// Maximum time spent retrying a lock acquisition
pub const DEFAULT_LOCK_ACQUIRE_TIMEOUT_MS: u64 = 5_000;

/// Base delay between lock acquisition attempts
pub const DEFAULT_LOCK_RETRY_MS: u64 = 50;

/// Upper bound of the random jitter added to each retry delay
pub const DEFAULT_LOCK_RETRY_JITTER_MS: u64 = 25;

// ============================================================================
// QUEUE
// ============================================================================

/// How long a single blocking receive waits before returning empty
pub const DEFAULT_QUEUE_BLOCK_MS: u64 = 1_000;

/// Back-off after a failed receive before trying again
pub const DEFAULT_RECEIVE_RETRY_MS: u64 = 500;

/// Stream prefix; a queue's stream key is `{prefix}{name}`
pub const DEFAULT_STREAM_PREFIX: &str = "tally:queue:";

/// Consumer group shared by every reconciler
pub const DEFAULT_CONSUMER_GROUP: &str = "tally-reconciler";

/// Unacked stream entries idle this long are claimed from their consumer,
/// which is presumed dead. Also the interval between claim passes.
pub const DEFAULT_CLAIM_IDLE_MS: u64 = 30_000;
