//! Redis Streams queue configuration.

use redis::aio::ConnectionManager;
use redis::Client;
use std::time::Duration;
use tally_core::constants::{DEFAULT_CLAIM_IDLE_MS, DEFAULT_CONSUMER_GROUP, DEFAULT_STREAM_PREFIX};
use tally_core::{QueueError, TallyResult};

/// Connection and consumer-group settings of the stream queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub url: String,
    /// Prefix of stream keys (`{prefix}{queue}`).
    pub stream_prefix: String,
    /// Consumer group every reconciler joins.
    pub consumer_group: String,
    /// This process's consumer name inside the group. Stable across
    /// restarts so a restarted process replays its own pending entries.
    pub consumer_name: String,
    /// Pending entries idle longer than this are claimed from other
    /// consumers.
    pub claim_idle: Duration,
    pub connection_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            stream_prefix: DEFAULT_STREAM_PREFIX.to_string(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            consumer_name: consumer_name_for(std::env::var("HOSTNAME").ok()),
            claim_idle: Duration::from_millis(DEFAULT_CLAIM_IDLE_MS),
            connection_timeout: Duration::from_secs(2),
        }
    }
}

/// `tally-{host}`, or plain `tally` when the host is unknown.
fn consumer_name_for(hostname: Option<String>) -> String {
    match hostname.map(|h| h.trim().to_string()).filter(|h| !h.is_empty()) {
        Some(host) => format!("tally-{}", host),
        None => "tally".to_string(),
    }
}

impl QueueConfig {
    /// Environment variables:
    /// - `TALLY_REDIS_URL` (default: redis://127.0.0.1:6379)
    /// - `TALLY_REDIS_STREAM_PREFIX` (default: tally:queue:)
    /// - `TALLY_REDIS_CONSUMER_GROUP` (default: tally-reconciler)
    /// - `TALLY_REDIS_CONSUMER_NAME` (default: tally-{HOSTNAME})
    /// - `TALLY_QUEUE_CLAIM_IDLE_MS` (default: 30000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("TALLY_REDIS_URL").unwrap_or(defaults.url),
            stream_prefix: std::env::var("TALLY_REDIS_STREAM_PREFIX")
                .unwrap_or(defaults.stream_prefix),
            consumer_group: std::env::var("TALLY_REDIS_CONSUMER_GROUP")
                .unwrap_or(defaults.consumer_group),
            consumer_name: std::env::var("TALLY_REDIS_CONSUMER_NAME")
                .unwrap_or(defaults.consumer_name),
            claim_idle: std::env::var("TALLY_QUEUE_CLAIM_IDLE_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.claim_idle),
            connection_timeout: defaults.connection_timeout,
        }
    }

    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = name.into();
        self
    }

    pub fn with_claim_idle(mut self, idle: Duration) -> Self {
        self.claim_idle = idle;
        self
    }

    /// Open a reconnecting connection manager for `queue`.
    pub async fn connect(&self, queue: &str) -> TallyResult<ConnectionManager> {
        let unavailable = |reason: String| QueueError::Unavailable {
            queue: queue.to_string(),
            reason,
        };

        let client = Client::open(self.url.as_str()).map_err(|e| unavailable(e.to_string()))?;
        let manager = tokio::time::timeout(self.connection_timeout, client.get_connection_manager())
            .await
            .map_err(|_| unavailable(format!("connection to {} timed out", self.url)))?
            .map_err(|e| unavailable(e.to_string()))?;
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.stream_prefix, "tally:queue:");
        assert_eq!(config.consumer_group, "tally-reconciler");
        assert_eq!(config.claim_idle, Duration::from_secs(30));
    }

    #[test]
    fn test_consumer_name_is_stable_across_restarts() {
        assert_eq!(
            consumer_name_for(Some("worker-1".to_string())),
            consumer_name_for(Some("worker-1".to_string()))
        );
        assert_eq!(consumer_name_for(Some("worker-1".to_string())), "tally-worker-1");
        assert_eq!(consumer_name_for(Some("  ".to_string())), "tally");
        assert_eq!(consumer_name_for(None), "tally");
    }
}
