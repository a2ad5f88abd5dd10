//! Durable queue layer: transports with at-least-once delivery, the
//! name+version envelope every payload travels in, and the enqueuer that
//! splits oversized messages and packs small ones into bulk envelopes.

pub mod enqueuer;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod schema;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use enqueuer::MessageEnqueuer;
pub use memory::InMemoryQueue;
#[cfg(feature = "postgres")]
pub use postgres::PostgresQueue;
pub use schema::{BULK_SCHEMA, Envelope, HomogeneousBulk, QueueMessage};

/// The two logical queues every transport exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Work,
    Poison,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Work => "work",
            QueueName::Poison => "poison",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message handed to a consumer. It stays invisible to other consumers
/// until its visibility timeout lapses or it is completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub id: String,
    pub receipt: String,
    pub body: String,
    /// Deliveries so far, including this one.
    pub dequeue_count: u32,
}

#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Create backing storage. Safe to call repeatedly.
    async fn initialize(&self) -> Result<()>;

    /// Largest body `send` accepts, in bytes.
    fn max_message_size(&self) -> usize;

    async fn send(&self, queue: QueueName, body: String, delay: Duration)
    -> Result<()>;

    /// Up to `max` visible messages. Work messages that were already
    /// delivered the transport's maximum number of times are moved to the
    /// poison queue instead of being returned.
    async fn receive(
        &self,
        queue: QueueName,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>>;

    /// Remove a delivered message. A stale receipt (the message was already
    /// redelivered elsewhere) is ignored.
    async fn complete(&self, queue: QueueName, message: &ReceivedMessage)
    -> Result<()>;

    /// Messages in the queue, visible or not.
    async fn approximate_count(&self, queue: QueueName) -> Result<usize>;
}
