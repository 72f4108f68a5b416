//! Redis Streams broker.
//!
//! One stream per queue (`{prefix}{name}`) read through a consumer group.
//! Manual mode leaves entries in the group's pending list until `XACK`;
//! auto mode reads with `NOACK`. Acked entries are deleted from the stream.
//! Entries left pending by a consumer that went away are claimed with
//! `XAUTOCLAIM` once they have been idle for the configured threshold.

use crate::config::QueueConfig;
use crate::traits::{ActionQueue, Delivery};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::StreamReadReply;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tally_core::{AckMode, QueueError, TallyResult};

const BODY_FIELD: &str = "body";

/// Upper bound of entries claimed per `XAUTOCLAIM` pass
const CLAIM_BATCH: usize = 100;

pub struct RedisStreamQueue {
    name: String,
    stream: String,
    group: String,
    consumer: String,
    ack_mode: AckMode,
    block: Duration,
    conn: ConnectionManager,
    /// Read this consumer's pending entries before new ones. Set at start
    /// (crash recovery), after a requeue and after a claim.
    replay_pending: AtomicBool,
    claim_idle: Duration,
    last_claim: Mutex<Option<Instant>>,
}

impl RedisStreamQueue {
    /// Open a queue on its own connection.
    ///
    /// `XREADGROUP BLOCK` holds the connection for the block interval, so
    /// queues do not share the cache's connection.
    pub async fn connect(
        config: &QueueConfig,
        name: &str,
        ack_mode: AckMode,
        block: Duration,
    ) -> TallyResult<Self> {
        let conn = config.connect(name).await?;
        let queue = Self {
            name: name.to_string(),
            stream: format!("{}{}", config.stream_prefix, name),
            group: config.consumer_group.clone(),
            consumer: config.consumer_name.clone(),
            ack_mode,
            block,
            conn,
            replay_pending: AtomicBool::new(ack_mode == AckMode::Manual),
            claim_idle: config.claim_idle,
            last_claim: Mutex::new(None),
        };
        queue.ensure_group().await?;
        Ok(queue)
    }

    pub fn stream_key(&self) -> &str {
        &self.stream
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    fn unavailable(&self) -> impl Fn(redis::RedisError) -> QueueError + '_ {
        move |e| QueueError::Unavailable {
            queue: self.name.clone(),
            reason: e.to_string(),
        }
    }

    async fn ensure_group(&self) -> TallyResult<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => {
                tracing::info!(stream = %self.stream, group = %self.group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(self.unavailable()(e).into()),
        }
    }

    async fn read(&self, from: &str, block: bool) -> TallyResult<Option<Delivery>> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1);
        if block {
            cmd.arg("BLOCK").arg(self.block.as_millis() as u64);
        }
        if self.ack_mode.is_auto() {
            cmd.arg("NOACK");
        }
        cmd.arg("STREAMS").arg(&self.stream).arg(from);

        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut conn)
            .await
            .map_err(self.unavailable())?;

        let Some(entry) = reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|k| k.ids.into_iter().next())
        else {
            return Ok(None);
        };

        let body: Vec<u8> = entry.get(BODY_FIELD).unwrap_or_default();
        if self.ack_mode.is_auto() {
            self.delete_entry(&entry.id).await?;
        }
        Ok(Some(Delivery {
            tag: entry.id,
            body,
            redelivered: from != ">",
        }))
    }

    /// Whether a claim pass is due; marks it started if so.
    fn claim_due(&self) -> bool {
        if self.ack_mode.is_auto() {
            return false;
        }
        let Ok(mut last) = self.last_claim.lock() else {
            return true;
        };
        match *last {
            Some(at) if at.elapsed() < self.claim_idle => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    /// Move entries idle longer than `claim_idle` into this consumer's
    /// pending list. Returns how many were claimed.
    async fn claim_stale(&self) -> TallyResult<usize> {
        let mut conn = self.conn.clone();
        let reply: Vec<redis::Value> = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.claim_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(CLAIM_BATCH)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await
            .map_err(self.unavailable())?;
        let claimed: Vec<String> = match reply.get(1) {
            Some(ids) => redis::from_redis_value(ids).map_err(self.unavailable())?,
            None => Vec::new(),
        };
        if !claimed.is_empty() {
            tracing::warn!(
                stream = %self.stream,
                consumer = %self.consumer,
                claimed = claimed.len(),
                "Claimed stale pending entries"
            );
        }
        Ok(claimed.len())
    }

    async fn delete_entry(&self, id: &str) -> TallyResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("XDEL")
            .arg(&self.stream)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(self.unavailable())?;
        Ok(())
    }

    async fn ack_entry(&self, delivery: &Delivery) -> TallyResult<()> {
        let ack_failed = |reason: String| QueueError::AckFailed {
            queue: self.name.clone(),
            tag: delivery.tag.clone(),
            reason,
        };
        let mut conn = self.conn.clone();
        let (acked, _deleted): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&delivery.tag)
            .cmd("XDEL")
            .arg(&self.stream)
            .arg(&delivery.tag)
            .query_async(&mut conn)
            .await
            .map_err(|e| ack_failed(e.to_string()))?;
        if acked != 1 {
            return Err(ack_failed("entry was not pending".to_string()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl ActionQueue for RedisStreamQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    async fn publish(&self, body: &[u8]) -> TallyResult<()> {
        let mut conn = self.conn.clone();
        let _id: String = redis::cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg(BODY_FIELD)
            .arg(body)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::PublishFailed {
                queue: self.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn receive(&self) -> TallyResult<Option<Delivery>> {
        if self.claim_due() && self.claim_stale().await? > 0 {
            self.replay_pending.store(true, Ordering::SeqCst);
        }
        if self.replay_pending.load(Ordering::SeqCst) {
            match self.read("0", false).await? {
                Some(delivery) => return Ok(Some(delivery)),
                None => self.replay_pending.store(false, Ordering::SeqCst),
            }
        }
        self.read(">", true).await
    }

    async fn ack(&self, delivery: &Delivery) -> TallyResult<()> {
        if self.ack_mode.is_auto() {
            return Ok(());
        }
        self.ack_entry(delivery).await
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> TallyResult<()> {
        if self.ack_mode.is_auto() {
            return Ok(());
        }
        if requeue {
            // the entry stays in our pending list; replay it next
            self.replay_pending.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            self.ack_entry(delivery).await
        }
    }

    async fn ping(&self) -> TallyResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(self.unavailable())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis_tests_enabled() -> bool {
        std::env::var("REDIS_TESTS").map(|v| v == "1").unwrap_or(false)
    }

    fn test_config() -> QueueConfig {
        let mut config = QueueConfig::from_env();
        config.stream_prefix = format!("tally:test:{}:", std::process::id());
        config
    }

    #[tokio::test]
    async fn test_stream_publish_receive_ack() {
        if !redis_tests_enabled() {
            return;
        }
        let queue = RedisStreamQueue::connect(
            &test_config(),
            "favorite",
            AckMode::Manual,
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        queue.ping().await.unwrap();

        queue.publish(b"{\"n\":1}").await.unwrap();
        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(delivery.body, b"{\"n\":1}");

        queue.reject(&delivery, true).await.unwrap();
        let again = queue.receive().await.unwrap().unwrap();
        assert_eq!(again.tag, delivery.tag);
        assert!(again.redelivered);

        queue.ack(&again).await.unwrap();
        assert!(queue.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entries_of_a_vanished_consumer_are_claimed() {
        if !redis_tests_enabled() {
            return;
        }
        let config = test_config();
        let block = Duration::from_millis(200);
        let crashed = RedisStreamQueue::connect(
            &config.clone().with_consumer_name("crashed"),
            "relation",
            AckMode::Manual,
            block,
        )
        .await
        .unwrap();
        crashed.publish(b"{\"n\":2}").await.unwrap();
        let lost = crashed.receive().await.unwrap().unwrap();
        drop(crashed);

        let restarted = RedisStreamQueue::connect(
            &config
                .with_consumer_name("restarted")
                .with_claim_idle(Duration::from_millis(50)),
            "relation",
            AckMode::Manual,
            block,
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let delivery = restarted.receive().await.unwrap().unwrap();
        assert_eq!(delivery.tag, lost.tag);
        assert_eq!(delivery.body, b"{\"n\":2}");
        assert!(delivery.redelivered);
        restarted.ack(&delivery).await.unwrap();
    }
}
