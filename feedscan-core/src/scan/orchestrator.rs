//! Index scan state machine.
//!
//! The scan's state lives only in its row. Every delivery of the index scan
//! message loads the row, performs the I/O its current state calls for,
//! feeds the result into [`transition`] and persists what comes out. A crash
//! anywhere replays from the last persisted state on the next delivery.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use feedscan_model::{
    IndexScan, IndexScanMessage, PageScan, PageScanMessage, PageScanState, ScanState,
};
use tracing::{debug, info};

use crate::error::{Result, ScanError};
use crate::feed::FeedClient;
use crate::queue::MessageEnqueuer;
use crate::scan::driver::DriverRegistry;
use crate::scan::storage::ScanStorageService;
use crate::store::Versioned;

/// Delay before an enqueued scan checks on its children again.
pub const COMPLETION_POLL_DELAY: Duration = Duration::from_secs(2);

/// What the I/O step of the current state observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepInput {
    /// Created: the feed index was read.
    IndexRead {
        index_commit: DateTime<Utc>,
        default_min: DateTime<Utc>,
        now: DateTime<Utc>,
    },
    /// Scoped: every page row in bounds exists.
    PagesInserted,
    /// Expanded: one message per page row was sent.
    PagesEnqueued,
    /// Enqueued: the child lower bound and the driver's aggregate check.
    Progress {
        remaining: usize,
        aggregate_complete: bool,
        now: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Store the new scan and keep going.
    Persist,
    /// Leave the row as is and deliver the message again later.
    Poll { delay: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub scan: IndexScan,
    pub effect: Effect,
}

/// Pure transition table of the index scan lifecycle.
pub fn transition(scan: &IndexScan, input: StepInput) -> Result<Transition> {
    let mut next = scan.clone();
    let effect = match (scan.state, input) {
        (
            ScanState::Created,
            StepInput::IndexRead {
                index_commit,
                default_min,
                now,
            },
        ) => {
            let min = scan.min.unwrap_or(default_min);
            let max = scan.max.map_or(index_commit, |max| max.min(index_commit));
            if min >= max {
                return Err(ScanError::InvariantViolation(format!(
                    "scan {} has empty bounds ({min}, {max}] against feed commit {index_commit}",
                    scan.scan_id
                )));
            }
            next.min = Some(min);
            next.max = Some(max);
            next.started_at = Some(now);
            next.state = ScanState::Scoped;
            Effect::Persist
        }
        (ScanState::Scoped, StepInput::PagesInserted) => {
            next.state = ScanState::Expanded;
            Effect::Persist
        }
        (ScanState::Expanded, StepInput::PagesEnqueued) => {
            next.state = ScanState::Enqueued;
            Effect::Persist
        }
        (
            ScanState::Enqueued,
            StepInput::Progress {
                remaining,
                aggregate_complete,
                now,
            },
        ) => {
            if remaining > 0 || !aggregate_complete {
                Effect::Poll {
                    delay: COMPLETION_POLL_DELAY,
                }
            } else {
                next.state = ScanState::Complete;
                next.completed_at = Some(now);
                Effect::Persist
            }
        }
        (state, input) => {
            return Err(ScanError::InvariantViolation(format!(
                "scan {} cannot apply {input:?} in state {state}",
                scan.scan_id
            )));
        }
    };
    Ok(Transition { scan: next, effect })
}

/// Handles index scan messages.
#[derive(Clone)]
pub struct IndexScanProcessor {
    storage: ScanStorageService,
    feed: Arc<dyn FeedClient>,
    enqueuer: MessageEnqueuer,
    drivers: DriverRegistry,
    default_min: DateTime<Utc>,
}

impl fmt::Debug for IndexScanProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexScanProcessor")
            .field("drivers", &self.drivers)
            .field("default_min", &self.default_min)
            .finish()
    }
}

impl IndexScanProcessor {
    pub fn new(
        storage: ScanStorageService,
        feed: Arc<dyn FeedClient>,
        enqueuer: MessageEnqueuer,
        drivers: DriverRegistry,
        default_min: DateTime<Utc>,
    ) -> Self {
        Self {
            storage,
            feed,
            enqueuer,
            drivers,
            default_min,
        }
    }

    pub async fn process(&self, message: &IndexScanMessage) -> Result<()> {
        let Some(mut scan) = self
            .storage
            .get_index_scan(&message.cursor_name, &message.scan_id)
            .await?
        else {
            return Err(ScanError::NotFound(format!(
                "index scan {} for cursor '{}'",
                message.scan_id, message.cursor_name
            )));
        };
        let driver = self.drivers.get(scan.record.scan_type)?;

        loop {
            let input = match scan.record.state {
                ScanState::Created => {
                    let index = self.feed.fetch_index().await?;
                    StepInput::IndexRead {
                        index_commit: index.commit_timestamp,
                        default_min: self.default_min,
                        now: Utc::now(),
                    }
                }
                ScanState::Scoped => {
                    self.insert_missing_pages(&scan.record).await?;
                    StepInput::PagesInserted
                }
                ScanState::Expanded => {
                    self.enqueue_pages(&scan.record).await?;
                    StepInput::PagesEnqueued
                }
                ScanState::Enqueued => {
                    let remaining = self
                        .storage
                        .child_count_lower_bound(&scan.record.scan_id)
                        .await?;
                    let aggregate_complete = remaining == 0
                        && driver.is_aggregate_complete(&scan.record).await?;
                    StepInput::Progress {
                        remaining,
                        aggregate_complete,
                        now: Utc::now(),
                    }
                }
                ScanState::Complete => {
                    debug!(scan_id = %scan.record.scan_id, "index scan already complete");
                    return Ok(());
                }
            };

            let Transition { scan: next, effect } = transition(&scan.record, input)?;
            match effect {
                Effect::Persist => {
                    scan = self
                        .storage
                        .replace_index_scan(&Versioned {
                            record: next,
                            etag: scan.etag,
                        })
                        .await?;
                    info!(
                        scan_id = %scan.record.scan_id,
                        scan_type = %scan.record.scan_type,
                        state = %scan.record.state,
                        "index scan advanced"
                    );
                    if scan.record.is_complete() {
                        return Ok(());
                    }
                }
                Effect::Poll { delay } => {
                    debug!(
                        scan_id = %scan.record.scan_id,
                        delay_ms = delay.as_millis() as u64,
                        "children pending, polling again later"
                    );
                    return self
                        .enqueuer
                        .enqueue_delayed(std::slice::from_ref(message), delay)
                        .await;
                }
            }
        }
    }

    /// The page rows a scan's bounds call for, in page id order.
    pub async fn expected_pages(&self, scan: &IndexScan) -> Result<Vec<PageScan>> {
        let (min, max) = scan.bounds().ok_or_else(|| {
            ScanError::InvariantViolation(format!("scan {} has no bounds", scan.scan_id))
        })?;
        let index = self.feed.fetch_index().await?;
        Ok(index
            .pages_in_bounds(min, max)
            .into_iter()
            .map(|(page_id, page)| PageScan {
                scan_id: scan.scan_id.clone(),
                page_id,
                scan_type: scan.scan_type,
                state: PageScanState::Created,
                min,
                max,
                url: page.url.clone(),
                commit_timestamp: page.commit_timestamp,
            })
            .collect())
    }

    async fn insert_missing_pages(&self, scan: &IndexScan) -> Result<()> {
        let expected = self.expected_pages(scan).await?;
        let existing = self.storage.list_page_scans(&scan.scan_id).await?;

        let expected_urls: HashMap<&str, &PageScan> =
            expected.iter().map(|p| (p.url.as_str(), p)).collect();
        let unexpected: Vec<&str> = existing
            .iter()
            .filter(|p| {
                expected_urls
                    .get(p.url.as_str())
                    .is_none_or(|e| e.page_id != p.page_id)
            })
            .map(|p| p.url.as_str())
            .collect();
        if !unexpected.is_empty() {
            return Err(ScanError::InvariantViolation(format!(
                "scan {} already holds pages outside its bounds: {}",
                scan.scan_id,
                unexpected.join(", ")
            )));
        }

        let present: HashSet<&str> = existing.iter().map(|p| p.url.as_str()).collect();
        let missing: Vec<PageScan> = expected
            .iter()
            .filter(|p| !present.contains(p.url.as_str()))
            .cloned()
            .collect();
        info!(
            scan_id = %scan.scan_id,
            expected = expected.len(),
            existing = existing.len(),
            inserting = missing.len(),
            "expanding index scan"
        );
        self.storage.insert_page_scans(&missing).await
    }

    async fn enqueue_pages(&self, scan: &IndexScan) -> Result<()> {
        let mut pages = self.storage.list_page_scans(&scan.scan_id).await?;
        pages.sort_by(|a, b| {
            a.commit_timestamp
                .cmp(&b.commit_timestamp)
                .then_with(|| a.url.cmp(&b.url))
        });
        let messages: Vec<PageScanMessage> = pages
            .into_iter()
            .map(|page| PageScanMessage {
                scan_id: page.scan_id,
                page_id: page.page_id,
            })
            .collect();
        debug!(scan_id = %scan.scan_id, count = messages.len(), "enqueueing page scans");
        self.enqueuer.enqueue(&messages).await
    }
}
