use std::fmt;

use async_trait::async_trait;
use feedscan_model::{IndexScanMessage, LeafScanMessage, PageScanMessage};
use tracing::{Instrument, debug, debug_span, warn};

use crate::error::{Result, ScanError};
use crate::queue::{Envelope, HomogeneousBulk, MessageEnqueuer};
use crate::scan::{IndexScanProcessor, LeafScanProcessor, PageScanProcessor};

/// Outcome of handling one queue message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DispatchStatus {
    Success,
    /// Leave the message for redelivery.
    Retry { error: String },
    /// The message can never succeed; send it to the poison queue now.
    DeadLetter { error: String },
}

impl DispatchStatus {
    pub fn needs_retry(&self) -> bool {
        matches!(self, DispatchStatus::Retry { .. })
    }
}

/// Contract between worker loops and message handling.
#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    async fn dispatch(&self, body: &str) -> DispatchStatus;
}

/// Routes envelopes to the index, page and leaf processors and unpacks
/// bulk envelopes.
#[derive(Clone)]
pub struct PipelineDispatcher {
    index: IndexScanProcessor,
    page: PageScanProcessor,
    leaf: LeafScanProcessor,
    enqueuer: MessageEnqueuer,
}

impl fmt::Debug for PipelineDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineDispatcher")
            .field("enqueuer", &self.enqueuer)
            .finish()
    }
}

impl PipelineDispatcher {
    pub fn new(
        index: IndexScanProcessor,
        page: PageScanProcessor,
        leaf: LeafScanProcessor,
        enqueuer: MessageEnqueuer,
    ) -> Self {
        Self {
            index,
            page,
            leaf,
            enqueuer,
        }
    }

    /// Handle one decoded envelope. Inner messages of a bulk envelope that
    /// fail are re-enqueued on their own; the bulk itself then succeeds.
    pub async fn handle(&self, envelope: Envelope) -> Result<()> {
        if !envelope.is::<HomogeneousBulk>() {
            return self.handle_single(&envelope).await;
        }

        let bulk: HomogeneousBulk = envelope.open()?;
        let schema = bulk.schema.clone();
        let mut failed = Vec::new();
        let inner = bulk.into_envelopes();
        let total = inner.len();
        for envelope in inner {
            if let Err(err) = self.handle_single(&envelope).await {
                warn!(schema = %schema, error = %err, "bulk item failed, re-enqueueing it alone");
                failed.push(envelope);
            }
        }
        debug!(schema = %schema, total, failed = failed.len(), "handled bulk envelope");
        if !failed.is_empty() {
            self.enqueuer.enqueue_envelopes(failed).await?;
        }
        Ok(())
    }

    async fn handle_single(&self, envelope: &Envelope) -> Result<()> {
        if envelope.is::<IndexScanMessage>() {
            let message: IndexScanMessage = envelope.open()?;
            let span = debug_span!("index_scan", scan_id = %message.scan_id);
            self.index.process(&message).instrument(span).await
        } else if envelope.is::<PageScanMessage>() {
            let message: PageScanMessage = envelope.open()?;
            let span = debug_span!(
                "page_scan",
                scan_id = %message.scan_id,
                page_id = %message.page_id
            );
            self.page.process(&message).instrument(span).await
        } else if envelope.is::<LeafScanMessage>() {
            let message: LeafScanMessage = envelope.open()?;
            let span = debug_span!(
                "leaf_scan",
                scan_id = %message.scan_id,
                leaf_id = %message.leaf_id
            );
            self.leaf.process(&message).instrument(span).await
        } else {
            Err(envelope.unknown())
        }
    }
}

#[async_trait]
impl MessageDispatcher for PipelineDispatcher {
    async fn dispatch(&self, body: &str) -> DispatchStatus {
        let envelope = match Envelope::parse(body) {
            Ok(envelope) => envelope,
            Err(err) => {
                return DispatchStatus::DeadLetter {
                    error: err.to_string(),
                };
            }
        };
        match self.handle(envelope).await {
            Ok(()) => DispatchStatus::Success,
            Err(err @ ScanError::UnknownSchema { .. }) => DispatchStatus::DeadLetter {
                error: err.to_string(),
            },
            Err(err) => {
                warn!(
                    transient = err.is_transient(),
                    error = %err,
                    "message handler failed"
                );
                DispatchStatus::Retry {
                    error: err.to_string(),
                }
            }
        }
    }
}
