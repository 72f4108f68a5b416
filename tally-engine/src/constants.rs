//! Constants for the Tally engine binary and tasks.
//!
//! Reconciliation defaults (TTLs, intervals, lock timings) live in
//! `tally_core::constants`; this module holds the runtime-level ones.

// ============================================================================
// TELEMETRY
// ============================================================================

/// Default service name attached to log records.
pub const DEFAULT_SERVICE_NAME: &str = "tally";

/// Default `EnvFilter` directive when neither `TALLY_LOG_FILTER` nor
/// `RUST_LOG` is set.
pub const DEFAULT_LOG_FILTER: &str = "tally_engine=debug,tally_storage=info,info";

// ============================================================================
// SHUTDOWN
// ============================================================================

/// How long `Engine::shutdown` waits for each task before giving up on it.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
