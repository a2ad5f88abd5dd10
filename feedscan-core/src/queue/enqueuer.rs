use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt, stream};
use serde_json::Value;
use tracing::{debug, error};

use super::schema::{Envelope, HomogeneousBulk, QueueMessage};
use super::{QueueName, QueueTransport};
use crate::config::QueueConfig;
use crate::error::{Result, ScanError};

/// Splits an oversized message into smaller ones. `None` means the message
/// cannot be divided any further.
pub type SplitFn<'a, T> = &'a (dyn Fn(&T) -> Option<Vec<T>> + Send + Sync);

/// Split function for payloads that are never divided.
pub fn no_split<T>(_: &T) -> Option<Vec<T>> {
    None
}

/// A message that already fits the transport on its own.
#[derive(Debug)]
struct Prepared {
    body: String,
    data: Value,
    data_len: usize,
}

/// Serializes typed messages onto a [`QueueTransport`].
///
/// [`Self::enqueue`] never splits; [`Self::enqueue_with`] takes the split
/// function for payloads that can be divided.
#[derive(Clone)]
pub struct MessageEnqueuer {
    transport: Arc<dyn QueueTransport>,
    config: QueueConfig,
}

impl fmt::Debug for MessageEnqueuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageEnqueuer")
            .field("max_message_size", &self.max_message_size())
            .field("bulk_enqueue_threshold", &self.config.bulk_enqueue_threshold)
            .field("enqueue_parallelism", &self.config.enqueue_parallelism)
            .finish()
    }
}

impl MessageEnqueuer {
    pub fn new(transport: Arc<dyn QueueTransport>, config: QueueConfig) -> Self {
        Self { transport, config }
    }

    pub async fn initialize(&self) -> Result<()> {
        self.transport.initialize().await
    }

    pub fn transport(&self) -> &Arc<dyn QueueTransport> {
        &self.transport
    }

    /// Effective size limit: the smaller of the configured and transport
    /// limits.
    pub fn max_message_size(&self) -> usize {
        self.config
            .max_message_size
            .min(self.transport.max_message_size())
    }

    pub async fn enqueue<T: QueueMessage>(&self, messages: &[T]) -> Result<()> {
        self.enqueue_with(messages, &no_split::<T>, Duration::ZERO).await
    }

    pub async fn enqueue_delayed<T: QueueMessage>(
        &self,
        messages: &[T],
        not_before: Duration,
    ) -> Result<()> {
        self.enqueue_with(messages, &no_split::<T>, not_before).await
    }

    /// Enqueue to the work queue.
    ///
    /// Messages whose serialized form is over the size limit are passed to
    /// `split`, recursively, until every piece fits. The scan messages only
    /// carry identifiers and go through [`Self::enqueue`] with [`no_split`];
    /// callers with divisible payloads (lists of keys, say) supply their own
    /// `split` here. From
    /// `bulk_enqueue_threshold` messages on, pieces are packed greedily into
    /// bulk envelopes; below it each one is sent on its own.
    pub async fn enqueue_with<T: QueueMessage>(
        &self,
        messages: &[T],
        split: SplitFn<'_, T>,
        not_before: Duration,
    ) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let limit = self.max_message_size();
        let mut prepared = Vec::with_capacity(messages.len());
        for message in messages {
            prepare(message, split, limit, &mut prepared)?;
        }

        let threshold = self.config.bulk_enqueue_threshold;
        let bodies = if threshold > 0 && prepared.len() >= threshold {
            pack_bulk::<T>(prepared, limit)?
        } else {
            prepared.into_iter().map(|p| p.body).collect()
        };

        debug!(
            schema = T::SCHEMA,
            count = messages.len(),
            sends = bodies.len(),
            "enqueueing messages"
        );
        self.send_all(QueueName::Work, bodies, not_before).await
    }

    /// Send messages straight to the poison queue, one by one.
    pub async fn enqueue_poison<T: QueueMessage>(
        &self,
        messages: &[T],
        not_before: Duration,
    ) -> Result<()> {
        let limit = self.max_message_size();
        let mut prepared = Vec::with_capacity(messages.len());
        for message in messages {
            prepare(message, &no_split::<T>, limit, &mut prepared)?;
        }
        let bodies = prepared.into_iter().map(|p| p.body).collect();
        self.send_all(QueueName::Poison, bodies, not_before).await
    }

    /// Re-send already enveloped messages individually.
    pub async fn enqueue_envelopes(&self, envelopes: Vec<Envelope>) -> Result<()> {
        let bodies = envelopes
            .iter()
            .map(Envelope::to_body)
            .collect::<Result<Vec<_>>>()?;
        self.send_all(QueueName::Work, bodies, Duration::ZERO).await
    }

    async fn send_all(
        &self,
        queue: QueueName,
        bodies: Vec<String>,
        not_before: Duration,
    ) -> Result<()> {
        let parallelism = self.config.enqueue_parallelism.max(1);
        let transport = &self.transport;
        stream::iter(bodies)
            .map(|body| async move {
                transport.send(queue, body, not_before).await
            })
            .buffer_unordered(parallelism)
            .try_collect::<Vec<()>>()
            .await
            .inspect_err(|err| {
                error!(queue = %queue, error = %err, "failed to enqueue messages");
            })?;
        Ok(())
    }
}

fn prepare<T: QueueMessage>(
    message: &T,
    split: SplitFn<'_, T>,
    limit: usize,
    out: &mut Vec<Prepared>,
) -> Result<()> {
    let envelope = Envelope::wrap(message)?;
    let body = envelope.to_body()?;
    if body.len() <= limit {
        let data_len = serde_json::to_string(&envelope.data)?.len();
        out.push(Prepared {
            body,
            data: envelope.data,
            data_len,
        });
        return Ok(());
    }

    match split(message) {
        Some(parts) if parts.len() > 1 => {
            debug!(
                schema = T::SCHEMA,
                size = body.len(),
                parts = parts.len(),
                "splitting oversized message"
            );
            for part in &parts {
                prepare(part, split, limit, out)?;
            }
            Ok(())
        }
        _ => Err(ScanError::MessageTooLarge {
            size: body.len(),
            limit,
        }),
    }
}

/// Greedy packing: keep appending to the current bulk until the next item
/// would overflow, then start a new one. Items too big for even an empty
/// bulk go out on their own.
fn pack_bulk<T: QueueMessage>(
    prepared: Vec<Prepared>,
    limit: usize,
) -> Result<Vec<String>> {
    let empty = Envelope::wrap(&HomogeneousBulk {
        schema: T::SCHEMA.to_string(),
        version: T::VERSION,
        messages: Vec::new(),
    })?;
    let empty_len = empty.to_body()?.len();

    let mut bodies = Vec::new();
    let mut current: Vec<Value> = Vec::new();
    let mut current_len = empty_len;

    for item in prepared {
        if empty_len + item.data_len > limit {
            bodies.push(item.body);
            continue;
        }
        let separator = usize::from(!current.is_empty());
        if current_len + separator + item.data_len > limit {
            bodies.push(bulk_body::<T>(std::mem::take(&mut current))?);
            current_len = empty_len;
        }
        current_len += usize::from(!current.is_empty()) + item.data_len;
        current.push(item.data);
    }
    if !current.is_empty() {
        bodies.push(bulk_body::<T>(current)?);
    }
    Ok(bodies)
}

fn bulk_body<T: QueueMessage>(messages: Vec<Value>) -> Result<String> {
    Envelope::wrap(&HomogeneousBulk {
        schema: T::SCHEMA.to_string(),
        version: T::VERSION,
        messages,
    })?
    .to_body()
}
