//! Engine configuration
//!
//! Configuration is loaded from `TALLY_*` environment variables. Unset or
//! unparsable values fall back to the defaults in [`crate::constants`].

use crate::constants::*;
use crate::domain::Domain;
use crate::error::{ConfigError, TallyError, TallyResult};
use crate::event::PairKey;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

/// Distinct domains in first-seen order.
fn distinct_domains(domains: impl IntoIterator<Item = Domain>) -> Vec<Domain> {
    let mut distinct = Vec::new();
    for domain in domains {
        if !distinct.contains(&domain) {
            distinct.push(domain);
        }
    }
    distinct
}

/// Parse a comma-separated domain list, skipping unknown names and repeats.
fn parse_domains(list: &str) -> Vec<Domain> {
    distinct_domains(list.split(',').filter_map(|d| d.parse().ok()))
}

fn invalid(field: &str, value: impl fmt::Debug, reason: &str) -> TallyError {
    TallyError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: format!("{:?}", value),
        reason: reason.to_string(),
    })
}

// ============================================================================
// ACK MODE
// ============================================================================

/// Consumer acknowledgement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// The broker considers a message delivered as soon as it is received.
    Auto,
    /// The consumer acknowledges after processing; unacked messages are
    /// redelivered.
    #[default]
    Manual,
}

impl AckMode {
    pub fn is_auto(&self) -> bool {
        matches!(self, AckMode::Auto)
    }
}

impl FromStr for AckMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(AckMode::Auto),
            "manual" | "explicit" => Ok(AckMode::Manual),
            other => Err(ConfigError::InvalidValue {
                field: "ack_mode".to_string(),
                value: other.to_string(),
                reason: "expected 'auto' or 'manual'".to_string(),
            }),
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckMode::Auto => f.write_str("auto"),
            AckMode::Manual => f.write_str("manual"),
        }
    }
}

// ============================================================================
// LOCK CONFIGURATION
// ============================================================================

/// How keys of a domain map onto mutexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockGranularity {
    /// One mutex guards every key of the domain.
    #[default]
    PerDomain,
    /// Keys are spread over `n` mutexes by a stable hash of the pair.
    Sharded(u32),
}

impl LockGranularity {
    /// Name of the mutex guarding `pair` in `domain`.
    ///
    /// A given pair always maps to the same name, so per-key ordering holds
    /// under either granularity.
    pub fn lock_name(&self, domain: Domain, pair: PairKey) -> String {
        match self {
            LockGranularity::PerDomain => domain.lock_name().to_string(),
            LockGranularity::Sharded(shards) => {
                let shard = shard_of(pair, (*shards).max(1));
                format!("{}::{}", domain.lock_name(), shard)
            }
        }
    }
}

/// Stable across processes and builds: a splitmix64 finalizer over both ids.
fn shard_of(pair: PairKey, shards: u32) -> u32 {
    let mut x = (pair.actor_id as u64) ^ (pair.target_id as u64).rotate_left(32);
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^= x >> 31;
    (x % shards as u64) as u32
}

/// Lock manager settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    /// How long a lock is held before the backend expires it.
    pub lease: Duration,
    /// Deadline for a single acquisition, including retries.
    pub acquire_timeout: Duration,
    /// Base delay between attempts.
    pub retry_delay: Duration,
    /// Upper bound of random jitter added to each delay.
    pub retry_jitter: Duration,
    pub granularity: LockGranularity,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_millis(DEFAULT_LOCK_LEASE_MS),
            acquire_timeout: Duration::from_millis(DEFAULT_LOCK_ACQUIRE_TIMEOUT_MS),
            retry_delay: Duration::from_millis(DEFAULT_LOCK_RETRY_MS),
            retry_jitter: Duration::from_millis(DEFAULT_LOCK_RETRY_JITTER_MS),
            granularity: LockGranularity::PerDomain,
        }
    }
}

impl LockConfig {
    /// Environment variables:
    /// - `TALLY_LOCK_LEASE_MS` (default: 8000)
    /// - `TALLY_LOCK_ACQUIRE_TIMEOUT_MS` (default: 5000)
    /// - `TALLY_LOCK_RETRY_MS` (default: 50)
    /// - `TALLY_LOCK_RETRY_JITTER_MS` (default: 25)
    /// - `TALLY_LOCK_SHARDS`: 0 or unset for one mutex per domain
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let granularity = match env_parse::<u32>("TALLY_LOCK_SHARDS") {
            Some(n) if n > 0 => LockGranularity::Sharded(n),
            _ => LockGranularity::PerDomain,
        };

        Self {
            lease: env_millis("TALLY_LOCK_LEASE_MS").unwrap_or(defaults.lease),
            acquire_timeout: env_millis("TALLY_LOCK_ACQUIRE_TIMEOUT_MS")
                .unwrap_or(defaults.acquire_timeout),
            retry_delay: env_millis("TALLY_LOCK_RETRY_MS").unwrap_or(defaults.retry_delay),
            retry_jitter: env_millis("TALLY_LOCK_RETRY_JITTER_MS")
                .unwrap_or(defaults.retry_jitter),
            granularity,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration, jitter: Duration) -> Self {
        self.retry_delay = delay;
        self.retry_jitter = jitter;
        self
    }

    pub fn with_granularity(mut self, granularity: LockGranularity) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn validate(&self) -> TallyResult<()> {
        if self.lease.is_zero() {
            return Err(invalid("lock.lease", self.lease, "lease must be positive"));
        }
        if self.acquire_timeout.is_zero() {
            return Err(invalid(
                "lock.acquire_timeout",
                self.acquire_timeout,
                "acquire_timeout must be positive",
            ));
        }
        if self.retry_delay.is_zero() {
            return Err(invalid(
                "lock.retry_delay",
                self.retry_delay,
                "retry_delay must be positive",
            ));
        }
        if self.granularity == LockGranularity::Sharded(0) {
            return Err(invalid(
                "lock.granularity",
                self.granularity,
                "shard count must be at least 1",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// ENGINE CONFIGURATION
// ============================================================================

/// Settings for the reconciler and sweeper tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// TTL of read-view cache entries.
    pub read_ttl: Duration,
    pub favorite_sweep_interval: Duration,
    pub relation_sweep_interval: Duration,
    pub lock: LockConfig,
    pub ack_mode: AckMode,
    /// Upper bound on a single blocking queue receive.
    pub queue_block: Duration,
    /// Pause after a failed receive.
    pub receive_retry_delay: Duration,
    /// Domains whose reconciler and sweeper are started.
    pub domains: Vec<Domain>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_ttl: Duration::from_millis(DEFAULT_READ_TTL_MS),
            favorite_sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            relation_sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            lock: LockConfig::default(),
            ack_mode: AckMode::default(),
            queue_block: Duration::from_millis(DEFAULT_QUEUE_BLOCK_MS),
            receive_retry_delay: Duration::from_millis(DEFAULT_RECEIVE_RETRY_MS),
            domains: Domain::ALL.to_vec(),
        }
    }
}

impl EngineConfig {
    /// Create EngineConfig from environment variables.
    ///
    /// Environment variables:
    /// - `TALLY_READ_TTL_MS` (default: 6000)
    /// - `TALLY_FAVORITE_SWEEP_INTERVAL_SECS` (default: 10)
    /// - `TALLY_RELATION_SWEEP_INTERVAL_SECS` (default: 10)
    /// - `TALLY_ACK_MODE`: "auto" or "manual" (default: manual)
    /// - `TALLY_QUEUE_BLOCK_MS` (default: 1000)
    /// - `TALLY_RECEIVE_RETRY_MS` (default: 500)
    /// - `TALLY_DOMAINS`: comma-separated subset of "favorite,relation"
    /// - plus the `TALLY_LOCK_*` variables read by [`LockConfig::from_env`]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let domains = std::env::var("TALLY_DOMAINS")
            .ok()
            .map(|s| parse_domains(&s))
            .filter(|d| !d.is_empty())
            .unwrap_or(defaults.domains);

        Self {
            read_ttl: env_millis("TALLY_READ_TTL_MS").unwrap_or(defaults.read_ttl),
            favorite_sweep_interval: env_parse::<u64>("TALLY_FAVORITE_SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.favorite_sweep_interval),
            relation_sweep_interval: env_parse::<u64>("TALLY_RELATION_SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.relation_sweep_interval),
            lock: LockConfig::from_env(),
            ack_mode: env_parse("TALLY_ACK_MODE").unwrap_or(defaults.ack_mode),
            queue_block: env_millis("TALLY_QUEUE_BLOCK_MS").unwrap_or(defaults.queue_block),
            receive_retry_delay: env_millis("TALLY_RECEIVE_RETRY_MS")
                .unwrap_or(defaults.receive_retry_delay),
            domains,
        }
    }

    /// Sweep interval for a domain.
    pub fn sweep_interval(&self, domain: Domain) -> Duration {
        match domain {
            Domain::Favorite => self.favorite_sweep_interval,
            Domain::Relation => self.relation_sweep_interval,
        }
    }

    pub fn with_read_ttl(mut self, ttl: Duration) -> Self {
        self.read_ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, domain: Domain, interval: Duration) -> Self {
        match domain {
            Domain::Favorite => self.favorite_sweep_interval = interval,
            Domain::Relation => self.relation_sweep_interval = interval,
        }
        self
    }

    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_ack_mode(mut self, mode: AckMode) -> Self {
        self.ack_mode = mode;
        self
    }

    pub fn with_queue_block(mut self, block: Duration) -> Self {
        self.queue_block = block;
        self
    }

    pub fn with_receive_retry_delay(mut self, delay: Duration) -> Self {
        self.receive_retry_delay = delay;
        self
    }

    pub fn with_domains(mut self, domains: impl IntoIterator<Item = Domain>) -> Self {
        self.domains = distinct_domains(domains);
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> TallyResult<()> {
        if self.read_ttl.is_zero() {
            return Err(invalid("read_ttl", self.read_ttl, "read_ttl must be positive"));
        }
        for domain in Domain::ALL {
            let interval = self.sweep_interval(domain);
            if interval.is_zero() {
                return Err(invalid(
                    &format!("{}_sweep_interval", domain),
                    interval,
                    "sweep interval must be positive",
                ));
            }
        }
        if self.queue_block.is_zero() {
            return Err(invalid(
                "queue_block",
                self.queue_block,
                "queue_block must be positive",
            ));
        }
        if self.receive_retry_delay.is_zero() {
            return Err(invalid(
                "receive_retry_delay",
                self.receive_retry_delay,
                "receive_retry_delay must be positive",
            ));
        }
        if self.domains.is_empty() {
            return Err(TallyError::Config(ConfigError::MissingRequired {
                field: "domains".to_string(),
            }));
        }
        self.lock.validate()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.read_ttl, Duration::from_secs(6));
        assert_eq!(config.sweep_interval(Domain::Favorite), Duration::from_secs(10));
        assert_eq!(config.sweep_interval(Domain::Relation), Duration::from_secs(10));
        assert_eq!(config.ack_mode, AckMode::Manual);
        assert_eq!(config.domains, vec![Domain::Favorite, Domain::Relation]);
        assert_eq!(config.lock.granularity, LockGranularity::PerDomain);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_sets_independent_intervals() {
        let config = EngineConfig::default()
            .with_sweep_interval(Domain::Relation, Duration::from_secs(3));
        assert_eq!(config.sweep_interval(Domain::Favorite), Duration::from_secs(10));
        assert_eq!(config.sweep_interval(Domain::Relation), Duration::from_secs(3));
    }

    #[test]
    fn test_validate_rejects_zero_durations() {
        let zero = Duration::ZERO;
        assert!(EngineConfig::default().with_read_ttl(zero).validate().is_err());
        assert!(EngineConfig::default()
            .with_sweep_interval(Domain::Favorite, zero)
            .validate()
            .is_err());
        assert!(EngineConfig::default()
            .with_lock(LockConfig::default().with_acquire_timeout(zero))
            .validate()
            .is_err());
        assert!(EngineConfig::default()
            .with_lock(LockConfig::default().with_granularity(LockGranularity::Sharded(0)))
            .validate()
            .is_err());
    }

    #[test]
    fn test_validate_rejects_empty_domains() {
        let err = EngineConfig::default()
            .with_domains([])
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            TallyError::Config(ConfigError::MissingRequired { .. })
        ));
    }

    #[test]
    fn test_ack_mode_parse() {
        assert_eq!("AUTO".parse::<AckMode>().unwrap(), AckMode::Auto);
        assert_eq!("manual".parse::<AckMode>().unwrap(), AckMode::Manual);
        assert!("sometimes".parse::<AckMode>().is_err());
    }

    #[test]
    fn test_per_domain_lock_name() {
        let name = LockGranularity::PerDomain.lock_name(Domain::Favorite, PairKey::new(1, 2));
        assert_eq!(name, "mutex-favorite");
    }

    #[test]
    fn test_sharded_lock_name_is_stable() {
        let granularity = LockGranularity::Sharded(16);
        let pair = PairKey::new(42, 7);
        let first = granularity.lock_name(Domain::Relation, pair);
        assert_eq!(first, granularity.lock_name(Domain::Relation, pair));
        assert!(first.starts_with("mutex-relation::"));

        let shard: u32 = first.rsplit("::").next().unwrap().parse().unwrap();
        assert!(shard < 16);
    }

    #[test]
    fn test_sharding_spreads_keys() {
        let granularity = LockGranularity::Sharded(8);
        let names: std::collections::HashSet<String> = (0..200)
            .map(|i| granularity.lock_name(Domain::Favorite, PairKey::new(i, i * 31)))
            .collect();
        assert!(names.len() > 1);
    }

    #[test]
    fn test_parse_domains_drops_repeats() {
        assert_eq!(
            parse_domains("favorite,relation,favorite"),
            vec![Domain::Favorite, Domain::Relation]
        );
        assert_eq!(parse_domains("relation, bogus ,relation"), vec![Domain::Relation]);
        assert!(parse_domains("").is_empty());
    }

    #[test]
    fn test_with_domains_keeps_first_occurrence() {
        let config = EngineConfig::default().with_domains([
            Domain::Relation,
            Domain::Favorite,
            Domain::Relation,
        ]);
        assert_eq!(config.domains, vec![Domain::Relation, Domain::Favorite]);
    }
}
