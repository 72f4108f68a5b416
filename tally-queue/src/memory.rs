//! In-process FIFO broker.

use crate::traits::{ActionQueue, Delivery};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tally_core::{AckMode, QueueError, TallyResult};
use tokio::sync::Notify;

#[derive(Debug)]
struct Message {
    tag: u64,
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Message>,
    in_flight: HashMap<u64, Vec<u8>>,
    next_tag: u64,
    closed: bool,
}

/// FIFO queue with `Notify` wakeups.
///
/// In manual mode received messages stay in flight until acked; rejecting
/// with requeue puts them back at the head.
#[derive(Debug, Clone)]
pub struct InMemoryQueue {
    name: String,
    ack_mode: AckMode,
    block: Duration,
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>, ack_mode: AckMode, block: Duration) -> Self {
        Self {
            name: name.into(),
            ack_mode,
            block,
            state: Arc::new(Mutex::new(State::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, QueueError> {
        self.state.lock().map_err(|_| QueueError::Unavailable {
            queue: self.name.clone(),
            reason: "queue state poisoned".to_string(),
        })
    }

    /// Messages waiting to be received.
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.ready.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages received but not yet acked (manual mode only).
    pub fn in_flight(&self) -> usize {
        self.lock().map(|s| s.in_flight.len()).unwrap_or(0)
    }

    /// Stop the queue. Waiting and later receivers get `QueueError::Closed`
    /// once the remaining messages are drained.
    pub fn close(&self) {
        if let Ok(mut state) = self.lock() {
            state.closed = true;
        }
        self.notify.notify_waiters();
    }

    fn parse_tag(&self, delivery: &Delivery) -> TallyResult<u64> {
        delivery.tag.parse().map_err(|_| {
            QueueError::AckFailed {
                queue: self.name.clone(),
                tag: delivery.tag.clone(),
                reason: "malformed delivery tag".to_string(),
            }
            .into()
        })
    }

    fn try_take(&self) -> TallyResult<Option<Delivery>> {
        let mut state = self.lock()?;
        if let Some(message) = state.ready.pop_front() {
            if self.ack_mode == AckMode::Manual {
                state.in_flight.insert(message.tag, message.body.clone());
            }
            return Ok(Some(Delivery {
                tag: message.tag.to_string(),
                body: message.body,
                redelivered: message.redelivered,
            }));
        }
        if state.closed {
            return Err(QueueError::Closed {
                queue: self.name.clone(),
            }
            .into());
        }
        Ok(None)
    }
}

#[async_trait]
impl ActionQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    async fn publish(&self, body: &[u8]) -> TallyResult<()> {
        {
            let mut state = self.lock()?;
            if state.closed {
                return Err(QueueError::Closed {
                    queue: self.name.clone(),
                }
                .into());
            }
            let tag = state.next_tag;
            state.next_tag += 1;
            state.ready.push_back(Message {
                tag,
                body: body.to_vec(),
                redelivered: false,
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self) -> TallyResult<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + self.block;
        loop {
            if let Some(delivery) = self.try_take()? {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.try_take();
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> TallyResult<()> {
        if self.ack_mode.is_auto() {
            return Ok(());
        }
        let tag = self.parse_tag(delivery)?;
        let mut state = self.lock()?;
        match state.in_flight.remove(&tag) {
            Some(_) => Ok(()),
            None => Err(QueueError::AckFailed {
                queue: self.name.clone(),
                tag: delivery.tag.clone(),
                reason: "unknown delivery tag".to_string(),
            }
            .into()),
        }
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> TallyResult<()> {
        if self.ack_mode.is_auto() {
            return Ok(());
        }
        let tag = self.parse_tag(delivery)?;
        {
            let mut state = self.lock()?;
            let Some(body) = state.in_flight.remove(&tag) else {
                return Err(QueueError::AckFailed {
                    queue: self.name.clone(),
                    tag: delivery.tag.clone(),
                    reason: "unknown delivery tag".to_string(),
                }
                .into());
            };
            if !requeue {
                return Ok(());
            }
            state.ready.push_front(Message {
                tag,
                body,
                redelivered: true,
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn ping(&self) -> TallyResult<()> {
        self.lock()?;
        Ok(())
    }
}
