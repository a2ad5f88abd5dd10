use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use super::{QueueName, QueueTransport, ReceivedMessage};
use crate::error::{Result, ScanError};

#[derive(Debug, Clone)]
struct QueuedMessage {
    id: Uuid,
    body: String,
    visible_at: Instant,
    dequeue_count: u32,
    receipt: Option<Uuid>,
}

/// Process-local transport with visibility timeouts, dequeue counting and
/// automatic poison routing. Uses tokio's clock so paused-time tests can
/// step through delays.
#[derive(Clone)]
pub struct InMemoryQueue {
    queues: Arc<Mutex<HashMap<QueueName, Vec<QueuedMessage>>>>,
    max_message_size: usize,
    max_dequeue_count: u32,
}

impl fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryQueue")
            .field("max_message_size", &self.max_message_size)
            .field("max_dequeue_count", &self.max_dequeue_count)
            .finish()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(65_536, 32)
    }
}

impl InMemoryQueue {
    pub fn new(max_message_size: usize, max_dequeue_count: u32) -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            max_message_size,
            max_dequeue_count,
        }
    }

    /// Bodies currently held by a queue, in send order.
    pub async fn bodies(&self, queue: QueueName) -> Vec<String> {
        let queues = self.queues.lock().await;
        queues
            .get(&queue)
            .map(|messages| messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueue {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    async fn send(
        &self,
        queue: QueueName,
        body: String,
        delay: Duration,
    ) -> Result<()> {
        if body.len() > self.max_message_size {
            return Err(ScanError::MessageTooLarge {
                size: body.len(),
                limit: self.max_message_size,
            });
        }
        let mut queues = self.queues.lock().await;
        queues.entry(queue).or_default().push(QueuedMessage {
            id: Uuid::now_v7(),
            body,
            visible_at: Instant::now() + delay,
            dequeue_count: 0,
            receipt: None,
        });
        Ok(())
    }

    async fn receive(
        &self,
        queue: QueueName,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        let now = Instant::now();
        let mut queues = self.queues.lock().await;

        if queue == QueueName::Work {
            let exhausted: Vec<QueuedMessage> = {
                let messages = queues.entry(queue).or_default();
                let (exhausted, kept): (Vec<_>, Vec<_>) =
                    std::mem::take(messages).into_iter().partition(|m| {
                        m.visible_at <= now
                            && m.dequeue_count >= self.max_dequeue_count
                    });
                *messages = kept;
                exhausted
            };
            if !exhausted.is_empty() {
                warn!(
                    count = exhausted.len(),
                    max_dequeue_count = self.max_dequeue_count,
                    "moving exhausted messages to poison queue"
                );
                let poison = queues.entry(QueueName::Poison).or_default();
                for mut message in exhausted {
                    message.dequeue_count = 0;
                    message.receipt = None;
                    message.visible_at = now;
                    poison.push(message);
                }
            }
        }

        let messages = queues.entry(queue).or_default();
        let mut received = Vec::new();
        for message in messages.iter_mut() {
            if received.len() >= max {
                break;
            }
            if message.visible_at > now {
                continue;
            }
            let receipt = Uuid::new_v4();
            message.dequeue_count += 1;
            message.receipt = Some(receipt);
            message.visible_at = now + visibility_timeout;
            received.push(ReceivedMessage {
                id: message.id.to_string(),
                receipt: receipt.to_string(),
                body: message.body.clone(),
                dequeue_count: message.dequeue_count,
            });
        }
        Ok(received)
    }

    async fn complete(
        &self,
        queue: QueueName,
        message: &ReceivedMessage,
    ) -> Result<()> {
        let mut queues = self.queues.lock().await;
        if let Some(messages) = queues.get_mut(&queue) {
            messages.retain(|m| {
                !(m.id.to_string() == message.id
                    && m.receipt.map(|r| r.to_string()).as_deref()
                        == Some(message.receipt.as_str()))
            });
        }
        Ok(())
    }

    async fn approximate_count(&self, queue: QueueName) -> Result<usize> {
        let queues = self.queues.lock().await;
        Ok(queues.get(&queue).map(Vec::len).unwrap_or(0))
    }
}
