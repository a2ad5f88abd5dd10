//! Per-scan-type strategies plugged into the pipeline.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use feedscan_model::{CatalogPage, IndexScan, LeafScan, PageScan, ScanType};
use serde_json::json;
use tracing::debug;

use crate::config::StorageConfig;
use crate::error::{Result, ScanError};
use crate::feed::FeedClient;
use crate::scan::latest::{LatestItemRecord, LatestItemResolver};
use crate::store::TableStore;

/// What a driver made of one leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafOutcome {
    /// Done; the leaf row can go.
    Processed,
    /// Not possible right now, e.g. the leaf document is not published yet.
    TryAgainLater { delay: Duration },
}

#[async_trait]
pub trait ScanDriver: Send + Sync {
    fn scan_type(&self) -> ScanType;

    /// Called once per page for download-only scans.
    async fn process_page(&self, _page: &PageScan, _document: &CatalogPage) -> Result<()> {
        Ok(())
    }

    /// Called once per leaf for fan-out scans. Must be idempotent.
    async fn process_leaf(&self, leaf: &LeafScan) -> Result<LeafOutcome> {
        Err(ScanError::InvariantViolation(format!(
            "scan type {} does not process individual leaves (leaf {})",
            self.scan_type(),
            leaf.row_key()
        )))
    }

    /// Extra completion gate once every page and leaf row of a scan is gone.
    async fn is_aggregate_complete(&self, _scan: &IndexScan) -> Result<bool> {
        Ok(true)
    }
}

/// Drivers keyed by the scan type they serve.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<ScanType, Arc<dyn ScanDriver>>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.drivers.keys().map(ScanType::as_str).collect();
        types.sort_unstable();
        f.debug_struct("DriverRegistry").field("scan_types", &types).finish()
    }
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in driver for every scan type.
    pub fn with_defaults(
        feed: Arc<dyn FeedClient>,
        store: Arc<dyn TableStore>,
        config: &StorageConfig,
    ) -> Self {
        let details = LatestItemResolver::new(store, config.leaf_details_table.clone(), config);
        Self::new()
            .with(WarmPagesDriver)
            .with(LatestLeavesDriver)
            .with(LeafDetailsDriver::new(feed, details))
    }

    pub fn with(mut self, driver: impl ScanDriver + 'static) -> Self {
        self.register(Arc::new(driver));
        self
    }

    /// Replaces any driver already registered for the same type.
    pub fn register(&mut self, driver: Arc<dyn ScanDriver>) {
        self.drivers.insert(driver.scan_type(), driver);
    }

    pub fn get(&self, scan_type: ScanType) -> Result<Arc<dyn ScanDriver>> {
        self.drivers
            .get(&scan_type)
            .cloned()
            .ok_or_else(|| ScanError::UnsupportedScanType(scan_type.to_string()))
    }
}

/// Fetching the page is the whole job.
#[derive(Debug, Clone, Copy, Default)]
pub struct WarmPagesDriver;

#[async_trait]
impl ScanDriver for WarmPagesDriver {
    fn scan_type(&self) -> ScanType {
        ScanType::WarmPages
    }

    async fn process_page(&self, page: &PageScan, document: &CatalogPage) -> Result<()> {
        debug!(
            scan_id = %page.scan_id,
            page_id = %page.page_id,
            leaves = document.items.len(),
            "warmed page"
        );
        Ok(())
    }
}

/// Latest leaf per item. The page processor merges page items directly, so
/// this driver never sees a leaf.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatestLeavesDriver;

#[async_trait]
impl ScanDriver for LatestLeavesDriver {
    fn scan_type(&self) -> ScanType {
        ScanType::LatestLeaves
    }
}

/// Fetches every leaf document and keeps the newest per item.
pub struct LeafDetailsDriver {
    feed: Arc<dyn FeedClient>,
    resolver: LatestItemResolver,
}

impl fmt::Debug for LeafDetailsDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafDetailsDriver")
            .field("table", &self.resolver.table())
            .finish()
    }
}

impl LeafDetailsDriver {
    pub fn new(feed: Arc<dyn FeedClient>, resolver: LatestItemResolver) -> Self {
        Self { feed, resolver }
    }
}

#[async_trait]
impl ScanDriver for LeafDetailsDriver {
    fn scan_type(&self) -> ScanType {
        ScanType::LeafDetails
    }

    async fn process_leaf(&self, leaf: &LeafScan) -> Result<LeafOutcome> {
        let document = self.feed.fetch_leaf(leaf.leaf_type, &leaf.url).await?;
        let record = LatestItemRecord::new(
            leaf.item_id.to_lowercase(),
            leaf.item_version.to_lowercase(),
            leaf.commit_timestamp,
            json!({
                "id": leaf.item_id,
                "version": leaf.item_version,
                "leafType": leaf.leaf_type.as_str(),
                "url": leaf.url,
                "document": document,
            }),
        );
        self.resolver.merge(vec![record]).await?;
        Ok(LeafOutcome::Processed)
    }
}
