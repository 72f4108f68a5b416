//! Action queue trait.

use async_trait::async_trait;
use tally_core::{AckMode, TallyResult};

/// One received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Backend-specific identifier used to ack or reject.
    pub tag: String,
    pub body: Vec<u8>,
    /// Whether this message was handed out before.
    pub redelivered: bool,
}

/// At-least-once broker for one named queue.
///
/// In [`AckMode::Auto`] a message counts as delivered once received and
/// `ack`/`reject` are no-ops. In [`AckMode::Manual`] unacknowledged
/// messages are handed out again.
#[async_trait]
pub trait ActionQueue: Send + Sync {
    /// Queue name ("favorite", "relation").
    fn name(&self) -> &str;

    fn ack_mode(&self) -> AckMode;

    /// Enqueue a message body. Returns once the broker has accepted it.
    async fn publish(&self, body: &[u8]) -> TallyResult<()>;

    /// Wait a bounded time for the next message.
    ///
    /// `Ok(None)` means nothing arrived in time. A closed queue returns
    /// [`QueueError::Closed`](tally_core::QueueError::Closed).
    async fn receive(&self) -> TallyResult<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> TallyResult<()>;

    /// Give a message back. With `requeue` it is delivered again,
    /// otherwise it is discarded.
    async fn reject(&self, delivery: &Delivery, requeue: bool) -> TallyResult<()>;

    async fn ping(&self) -> TallyResult<()>;
}
