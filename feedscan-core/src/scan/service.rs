//! Entry points for callers: starting scans and inspecting them.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use feedscan_model::{
    IndexScan, IndexScanMessage, LeafScanMessage, PageScanMessage, ScanId, ScanType,
};
use tracing::{info, warn};

use crate::error::{Result, ScanError};
use crate::feed::FeedClient;
use crate::queue::MessageEnqueuer;
use crate::scan::cursor::{CursorRecord, CursorStore};
use crate::scan::lease::LeaseService;
use crate::scan::storage::ScanStorageService;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartScanRequest {
    pub scan_type: ScanType,
    /// `None` starts an ad-hoc scan that no cursor tracks.
    pub cursor_name: Option<String>,
    pub min: Option<DateTime<Utc>>,
    pub max: Option<DateTime<Utc>>,
}

impl StartScanRequest {
    pub fn ad_hoc(scan_type: ScanType) -> Self {
        Self {
            scan_type,
            cursor_name: None,
            min: None,
            max: None,
        }
    }

    /// A scan advancing the type's default cursor.
    pub fn with_default_cursor(scan_type: ScanType) -> Self {
        Self {
            cursor_name: Some(scan_type.default_cursor_name()),
            ..Self::ad_hoc(scan_type)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(IndexScan),
    /// An incomplete scan of the same cursor exists and is returned instead.
    AlreadyRunning(IndexScan),
    /// Nothing new in the feed past the cursor.
    UpToDate {
        min: DateTime<Utc>,
        max: DateTime<Utc>,
    },
    /// Another caller is starting a scan for the same cursor right now.
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanStatus {
    pub scan: IndexScan,
    /// Lower bounds, see [`ScanStorageService::child_count_lower_bound`].
    pub pending_pages: usize,
    pub pending_leaves: usize,
    pub running: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequeueSummary {
    pub leaves: usize,
    pub pages: usize,
    pub index: bool,
}

#[derive(Clone)]
pub struct CatalogScanService {
    storage: ScanStorageService,
    cursors: Arc<dyn CursorStore>,
    leases: LeaseService,
    enqueuer: MessageEnqueuer,
    feed: Arc<dyn FeedClient>,
    default_min: DateTime<Utc>,
}

impl fmt::Debug for CatalogScanService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogScanService")
            .field("storage", &self.storage)
            .field("enqueuer", &self.enqueuer)
            .field("default_min", &self.default_min)
            .finish()
    }
}

impl CatalogScanService {
    pub fn new(
        storage: ScanStorageService,
        cursors: Arc<dyn CursorStore>,
        leases: LeaseService,
        enqueuer: MessageEnqueuer,
        feed: Arc<dyn FeedClient>,
        default_min: DateTime<Utc>,
    ) -> Self {
        Self {
            storage,
            cursors,
            leases,
            enqueuer,
            feed,
            default_min,
        }
    }

    pub async fn initialize(&self) -> Result<()> {
        self.storage.initialize().await?;
        self.enqueuer.initialize().await
    }

    pub fn cursors(&self) -> &Arc<dyn CursorStore> {
        &self.cursors
    }

    pub async fn start(&self, request: StartScanRequest) -> Result<StartOutcome> {
        let cursor_name = request.cursor_name.clone().unwrap_or_default();
        if !cursor_name.is_empty() && !request.scan_type.supports_cursor() {
            return Err(ScanError::InvalidRequest(format!(
                "scan type {} cannot advance cursor '{cursor_name}'",
                request.scan_type
            )));
        }
        if let (Some(min), Some(max)) = (request.min, request.max)
            && min >= max
        {
            return Err(ScanError::InvalidRequest(format!(
                "min {min} must be before max {max}"
            )));
        }

        if cursor_name.is_empty() {
            return self.start_unguarded(&request, &cursor_name).await;
        }

        if let Some(running) = self.incomplete_scan(&cursor_name).await? {
            return Ok(StartOutcome::AlreadyRunning(running));
        }
        let lease_name = format!("Start-{cursor_name}");
        let Some(guard) = self.leases.try_acquire(&lease_name).await? else {
            return Ok(StartOutcome::Busy);
        };
        let outcome = match self.incomplete_scan(&cursor_name).await {
            Ok(Some(running)) => Ok(StartOutcome::AlreadyRunning(running)),
            Ok(None) => self.start_unguarded(&request, &cursor_name).await,
            Err(err) => Err(err),
        };
        if let Err(err) = self.leases.release(guard).await {
            warn!(lease = %lease_name, error = %err, "failed to release start lease");
        }
        outcome
    }

    async fn start_unguarded(
        &self,
        request: &StartScanRequest,
        cursor_name: &str,
    ) -> Result<StartOutcome> {
        let cursor = if cursor_name.is_empty() {
            None
        } else {
            self.cursors.get(cursor_name).await?.map(|c| c.value)
        };
        let requested = request.min.unwrap_or(self.default_min);
        let min = cursor.map_or(requested, |cursor| cursor.max(requested));
        let max = match request.max {
            Some(max) => max,
            None => self.feed.fetch_index().await?.commit_timestamp,
        };
        if min >= max {
            info!(cursor = %cursor_name, %min, %max, "cursor is up to date");
            return Ok(StartOutcome::UpToDate { min, max });
        }

        let scan = IndexScan::new(
            ScanId::new(),
            cursor_name,
            request.scan_type,
            Some(min),
            Some(max),
        );
        self.storage.insert_index_scan(&scan).await?;
        self.enqueuer
            .enqueue(&[IndexScanMessage {
                cursor_name: scan.cursor_name.clone(),
                scan_id: scan.scan_id.clone(),
            }])
            .await?;
        info!(
            scan_id = %scan.scan_id,
            scan_type = %scan.scan_type,
            cursor = %cursor_name,
            %min,
            %max,
            "started index scan"
        );
        Ok(StartOutcome::Started(scan))
    }

    async fn incomplete_scan(&self, cursor_name: &str) -> Result<Option<IndexScan>> {
        Ok(self
            .storage
            .latest_index_scans(cursor_name, 1)
            .await?
            .into_iter()
            .find(|scan| !scan.is_complete()))
    }

    pub async fn get_scan(
        &self,
        cursor_name: &str,
        scan_id: &ScanId,
    ) -> Result<Option<IndexScan>> {
        Ok(self
            .storage
            .get_index_scan(cursor_name, scan_id)
            .await?
            .map(|v| v.record))
    }

    pub async fn status(&self, cursor_name: &str, scan_id: &ScanId) -> Result<Option<ScanStatus>> {
        let Some(scan) = self.get_scan(cursor_name, scan_id).await? else {
            return Ok(None);
        };
        let pending_pages = self.storage.page_count_lower_bound(scan_id).await?;
        let pending_leaves = self.storage.leaf_count_lower_bound(scan_id).await?;
        Ok(Some(ScanStatus {
            running: !scan.is_complete(),
            scan,
            pending_pages,
            pending_leaves,
        }))
    }

    pub async fn is_running(&self, cursor_name: &str, scan_id: &ScanId) -> Result<bool> {
        match self.get_scan(cursor_name, scan_id).await? {
            Some(scan) => Ok(!scan.is_complete()),
            None => Err(ScanError::NotFound(format!(
                "index scan {scan_id} for cursor '{cursor_name}'"
            ))),
        }
    }

    /// Newest first.
    pub async fn latest_scans(&self, cursor_name: &str, limit: usize) -> Result<Vec<IndexScan>> {
        self.storage.latest_index_scans(cursor_name, limit).await
    }

    /// Re-send a message for every leaf and page row left and for the scan
    /// itself. Useful once poisoned messages have been dealt with.
    pub async fn requeue(&self, cursor_name: &str, scan_id: &ScanId) -> Result<RequeueSummary> {
        let Some(scan) = self.get_scan(cursor_name, scan_id).await? else {
            return Err(ScanError::NotFound(format!(
                "index scan {scan_id} for cursor '{cursor_name}'"
            )));
        };
        if scan.is_complete() {
            return Ok(RequeueSummary::default());
        }

        let leaves: Vec<LeafScanMessage> = self
            .storage
            .list_leaf_scans(scan_id, None)
            .await?
            .into_iter()
            .map(|leaf| LeafScanMessage {
                scan_id: leaf.scan_id,
                page_id: leaf.page_id,
                leaf_id: leaf.leaf_id,
            })
            .collect();
        self.enqueuer.enqueue(&leaves).await?;

        let pages: Vec<PageScanMessage> = self
            .storage
            .list_page_scans(scan_id)
            .await?
            .into_iter()
            .map(|page| PageScanMessage {
                scan_id: page.scan_id,
                page_id: page.page_id,
            })
            .collect();
        self.enqueuer.enqueue(&pages).await?;

        self.enqueuer
            .enqueue(&[IndexScanMessage {
                cursor_name: cursor_name.to_string(),
                scan_id: scan_id.clone(),
            }])
            .await?;

        info!(
            scan_id = %scan_id,
            leaves = leaves.len(),
            pages = pages.len(),
            "requeued index scan"
        );
        Ok(RequeueSummary {
            leaves: leaves.len(),
            pages: pages.len(),
            index: true,
        })
    }

    /// Move the scan's cursor to the scan's max. Never moves a cursor
    /// backwards.
    pub async fn advance_cursor(
        &self,
        cursor_name: &str,
        scan_id: &ScanId,
    ) -> Result<CursorRecord> {
        if cursor_name.is_empty() {
            return Err(ScanError::InvalidRequest(
                "ad-hoc scans have no cursor to advance".into(),
            ));
        }
        let Some(scan) = self.get_scan(cursor_name, scan_id).await? else {
            return Err(ScanError::NotFound(format!(
                "index scan {scan_id} for cursor '{cursor_name}'"
            )));
        };
        let Some(max) = scan.max.filter(|_| scan.is_complete()) else {
            return Err(ScanError::InvalidRequest(format!(
                "scan {scan_id} is {} and cannot advance its cursor",
                scan.state
            )));
        };
        if let Some(current) = self.cursors.get(cursor_name).await?
            && current.value >= max
        {
            return Ok(current);
        }
        self.cursors.set(cursor_name, max).await
    }
}
