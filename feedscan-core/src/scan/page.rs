use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use feedscan_model::{
    LeafId, LeafScan, LeafScanMessage, PageMode, PageScan, PageScanMessage, PageScanState,
};
use tracing::{debug, info};

use crate::error::Result;
use crate::feed::FeedClient;
use crate::queue::MessageEnqueuer;
use crate::scan::driver::DriverRegistry;
use crate::scan::latest::{LatestItemRecord, LatestItemResolver};
use crate::scan::storage::ScanStorageService;
use crate::store::Versioned;

/// Handles page scan messages. The page row is deleted last, so a crash
/// before that point resumes the page on redelivery.
#[derive(Clone)]
pub struct PageScanProcessor {
    storage: ScanStorageService,
    feed: Arc<dyn FeedClient>,
    enqueuer: MessageEnqueuer,
    drivers: DriverRegistry,
    latest: LatestItemResolver,
}

impl fmt::Debug for PageScanProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageScanProcessor")
            .field("drivers", &self.drivers)
            .field("latest", &self.latest)
            .finish()
    }
}

impl PageScanProcessor {
    pub fn new(
        storage: ScanStorageService,
        feed: Arc<dyn FeedClient>,
        enqueuer: MessageEnqueuer,
        drivers: DriverRegistry,
        latest: LatestItemResolver,
    ) -> Self {
        Self {
            storage,
            feed,
            enqueuer,
            drivers,
            latest,
        }
    }

    pub async fn process(&self, message: &PageScanMessage) -> Result<()> {
        let Some(page) = self
            .storage
            .get_page_scan(&message.scan_id, &message.page_id)
            .await?
        else {
            debug!(
                scan_id = %message.scan_id,
                page_id = %message.page_id,
                "page scan already processed"
            );
            return Ok(());
        };
        self.process_page(page).await
    }

    /// Every write is conditional on the etag `page` was read at, so a copy
    /// of the row that another delivery has since moved on or deleted does
    /// nothing.
    pub async fn process_page(&self, page: Versioned<PageScan>) -> Result<()> {
        let driver = self.drivers.get(page.record.scan_type)?;

        let page = match page.record.scan_type.page_mode() {
            PageMode::DownloadOnly => {
                let document = self.feed.fetch_page(&page.record.url).await?;
                driver.process_page(&page.record, &document).await?;
                page
            }
            PageMode::FanOut => match self.fan_out(page).await? {
                Some(page) => page,
                None => return Ok(()),
            },
            PageMode::DirectAggregation => {
                let record = &page.record;
                let document = self.feed.fetch_page(&record.url).await?;
                let items = document
                    .leaves_in_bounds(
                        record.min,
                        record.max,
                        record.scan_type.excludes_redundant_leaves(),
                    )
                    .into_iter()
                    .map(|(_, item)| LatestItemRecord::from_leaf_item(item))
                    .collect::<Result<Vec<_>>>()?;
                let summary = self.latest.merge(items).await?;
                debug!(
                    scan_id = %record.scan_id,
                    page_id = %record.page_id,
                    inserted = summary.inserted,
                    replaced = summary.replaced,
                    skipped = summary.skipped,
                    "aggregated page"
                );
                page
            }
        };

        match self.storage.delete_page_scan(&page).await {
            Ok(_) => {
                info!(
                    scan_id = %page.record.scan_id,
                    page_id = %page.record.page_id,
                    "page scan done"
                );
                Ok(())
            }
            Err(err) if err.is_write_conflict() => {
                debug!(
                    scan_id = %page.record.scan_id,
                    page_id = %page.record.page_id,
                    "page scan taken over by another delivery"
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Created -> Expanding -> Enqueuing. Leaf rows are only inserted while
    /// this delivery holds the page, and messages go out for the rows that
    /// exist once the page reaches Enqueuing. Returns `None` when another
    /// delivery owns the page.
    async fn fan_out(&self, page: Versioned<PageScan>) -> Result<Option<Versioned<PageScan>>> {
        let target = page.record.state.max(PageScanState::Expanding);
        let Some(mut page) = self.claim(page, target).await? else {
            return Ok(None);
        };

        if page.record.state < PageScanState::Enqueuing {
            let record = &page.record;
            let document = self.feed.fetch_page(&record.url).await?;
            let leaves: Vec<LeafScan> = document
                .leaves_in_bounds(
                    record.min,
                    record.max,
                    record.scan_type.excludes_redundant_leaves(),
                )
                .into_iter()
                .map(|(leaf_id, item)| LeafScan::from_item(record, leaf_id, item))
                .collect();
            self.insert_missing_leaves(record, &leaves).await?;

            page = match self.claim(page, PageScanState::Enqueuing).await? {
                Some(page) => page,
                None => return Ok(None),
            };
        }

        let pending: Vec<LeafScanMessage> = self
            .storage
            .list_leaf_scans(&page.record.scan_id, Some(&page.record.page_id))
            .await?
            .into_iter()
            .map(|leaf| LeafScanMessage {
                scan_id: leaf.scan_id,
                page_id: leaf.page_id,
                leaf_id: leaf.leaf_id,
            })
            .collect();
        debug!(
            scan_id = %page.record.scan_id,
            page_id = %page.record.page_id,
            count = pending.len(),
            "fanning out leaves"
        );
        self.enqueuer.enqueue(&pending).await?;
        Ok(Some(page))
    }

    async fn insert_missing_leaves(&self, page: &PageScan, leaves: &[LeafScan]) -> Result<()> {
        let existing: HashSet<LeafId> = self
            .storage
            .list_leaf_scans(&page.scan_id, Some(&page.page_id))
            .await?
            .into_iter()
            .map(|leaf| leaf.leaf_id)
            .collect();
        let missing: Vec<LeafScan> = leaves
            .iter()
            .filter(|leaf| !existing.contains(&leaf.leaf_id))
            .cloned()
            .collect();
        debug!(
            scan_id = %page.scan_id,
            page_id = %page.page_id,
            existing = existing.len(),
            inserting = missing.len(),
            "expanding page"
        );
        self.storage.insert_leaf_scans(&missing).await
    }

    async fn claim(
        &self,
        mut page: Versioned<PageScan>,
        state: PageScanState,
    ) -> Result<Option<Versioned<PageScan>>> {
        page.record.state = state;
        match self.storage.replace_page_scan(&page).await {
            Ok(page) => Ok(Some(page)),
            Err(err) if err.is_write_conflict() => {
                debug!(
                    scan_id = %page.record.scan_id,
                    page_id = %page.record.page_id,
                    %state,
                    "page scan moved on under this delivery"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}
