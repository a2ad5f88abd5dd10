use std::fmt;

use feedscan_model::LeafScanMessage;
use tracing::{debug, warn};

use crate::error::Result;
use crate::queue::MessageEnqueuer;
use crate::scan::driver::{DriverRegistry, LeafOutcome};
use crate::scan::storage::ScanStorageService;

/// Handles leaf scan messages.
#[derive(Clone)]
pub struct LeafScanProcessor {
    storage: ScanStorageService,
    enqueuer: MessageEnqueuer,
    drivers: DriverRegistry,
    max_attempts: u32,
}

impl fmt::Debug for LeafScanProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafScanProcessor")
            .field("drivers", &self.drivers)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl LeafScanProcessor {
    pub fn new(
        storage: ScanStorageService,
        enqueuer: MessageEnqueuer,
        drivers: DriverRegistry,
        max_attempts: u32,
    ) -> Self {
        Self {
            storage,
            enqueuer,
            drivers,
            max_attempts,
        }
    }

    pub async fn process(&self, message: &LeafScanMessage) -> Result<()> {
        let Some(mut leaf) = self
            .storage
            .get_leaf_scan(&message.scan_id, &message.page_id, &message.leaf_id)
            .await?
        else {
            debug!(
                scan_id = %message.scan_id,
                page_id = %message.page_id,
                leaf_id = %message.leaf_id,
                "leaf scan already processed"
            );
            return Ok(());
        };

        let driver = self.drivers.get(leaf.record.scan_type)?;
        match driver.process_leaf(&leaf.record).await? {
            LeafOutcome::Processed => {
                self.storage.delete_leaf_scan(&leaf.record).await?;
                debug!(
                    scan_id = %message.scan_id,
                    leaf = %leaf.record.row_key(),
                    "leaf scan done"
                );
            }
            LeafOutcome::TryAgainLater { delay } => {
                leaf.record.attempt_count += 1;
                let leaf = self.storage.replace_leaf_scan(&leaf).await?;
                let messages = std::slice::from_ref(message);
                if leaf.record.attempt_count > self.max_attempts {
                    // The row stays, so the scan stays visibly incomplete.
                    warn!(
                        scan_id = %message.scan_id,
                        leaf = %leaf.record.row_key(),
                        attempts = leaf.record.attempt_count,
                        "leaf out of attempts, moving to poison queue"
                    );
                    self.enqueuer.enqueue_poison(messages, delay).await?;
                } else {
                    debug!(
                        scan_id = %message.scan_id,
                        leaf = %leaf.record.row_key(),
                        attempts = leaf.record.attempt_count,
                        delay_ms = delay.as_millis() as u64,
                        "driver asked to retry leaf later"
                    );
                    self.enqueuer.enqueue_delayed(messages, delay).await?;
                }
            }
        }
        Ok(())
    }
}
