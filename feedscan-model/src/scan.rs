use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::ModelError;
use crate::feed::{CatalogLeafItem, LeafType};
use crate::ids::{LeafId, PageId, ScanId};

/// Progress of an index scan. Variants are ordered, so `state >= Scoped`
/// reads the way the lifecycle does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScanState {
    Created,
    Scoped,
    Expanded,
    Enqueued,
    Complete,
}

impl ScanState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanState::Created => "created",
            ScanState::Scoped => "scoped",
            ScanState::Expanded => "expanded",
            ScanState::Enqueued => "enqueued",
            ScanState::Complete => "complete",
        }
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanState {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" => Ok(ScanState::Created),
            "scoped" => Ok(ScanState::Scoped),
            "expanded" => Ok(ScanState::Expanded),
            "enqueued" => Ok(ScanState::Enqueued),
            "complete" => Ok(ScanState::Complete),
            other => Err(ModelError::UnknownScanState(other.to_string())),
        }
    }
}

/// What the page processor does with the leaves of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageMode {
    /// Fetch the page and hand it to the driver; no per-leaf work.
    DownloadOnly,
    /// One leaf scan row and one queue message per in-bounds leaf.
    FanOut,
    /// Merge the in-bounds leaves straight into the latest-item table.
    DirectAggregation,
}

/// Closed set of scan kinds the pipeline knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScanType {
    /// Download every page in range, e.g. to warm an HTTP cache.
    WarmPages,
    /// Maintain the latest leaf per item without leaf-level fan-out.
    LatestLeaves,
    /// Fetch every leaf document and keep the newest one per item.
    LeafDetails,
}

impl ScanType {
    pub const ALL: [ScanType; 3] = [
        ScanType::WarmPages,
        ScanType::LatestLeaves,
        ScanType::LeafDetails,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanType::WarmPages => "warm-pages",
            ScanType::LatestLeaves => "latest-leaves",
            ScanType::LeafDetails => "leaf-details",
        }
    }

    pub fn page_mode(&self) -> PageMode {
        match self {
            ScanType::WarmPages => PageMode::DownloadOnly,
            ScanType::LatestLeaves => PageMode::DirectAggregation,
            ScanType::LeafDetails => PageMode::FanOut,
        }
    }

    /// Whether runs of this type may advance a named cursor.
    pub fn supports_cursor(&self) -> bool {
        !matches!(self, ScanType::WarmPages)
    }

    /// Whether only the newest leaf per item within a page matters.
    pub fn excludes_redundant_leaves(&self) -> bool {
        matches!(self, ScanType::LatestLeaves | ScanType::LeafDetails)
    }

    /// Cursor name used when a caller asks for the type's default cursor.
    pub fn default_cursor_name(&self) -> String {
        format!("scan-{}", self.as_str())
    }
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        ScanType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| ModelError::UnknownScanType(s.to_string()))
    }
}

/// One logical crawl of the feed over `(min, max]`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IndexScan {
    pub scan_id: ScanId,
    /// Empty for ad-hoc runs.
    pub cursor_name: String,
    pub scan_type: ScanType,
    pub state: ScanState,
    pub min: Option<DateTime<Utc>>,
    pub max: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub started_at: Option<DateTime<Utc>>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub completed_at: Option<DateTime<Utc>>,
}

impl IndexScan {
    pub fn new(
        scan_id: ScanId,
        cursor_name: impl Into<String>,
        scan_type: ScanType,
        min: Option<DateTime<Utc>>,
        max: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            scan_id,
            cursor_name: cursor_name.into(),
            scan_type,
            state: ScanState::Created,
            min,
            max,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == ScanState::Complete
    }

    /// Both bounds, once scoping has fixed them.
    pub fn bounds(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match (self.min, self.max) {
            (Some(min), Some(max)) => Some((min, max)),
            _ => None,
        }
    }
}

/// How far a fan-out page has got. Each step is persisted with a
/// conditional replace, so only the delivery holding the current etag moves
/// the page forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PageScanState {
    #[default]
    Created,
    /// Leaf rows are being inserted.
    Expanding,
    /// Every leaf row exists; messages are being sent.
    Enqueuing,
}

impl PageScanState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageScanState::Created => "created",
            PageScanState::Expanding => "expanding",
            PageScanState::Enqueuing => "enqueuing",
        }
    }
}

impl fmt::Display for PageScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A feed page that still has to be processed for a scan. The row's
/// existence is the "not yet done" signal.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PageScan {
    pub scan_id: ScanId,
    pub page_id: PageId,
    pub scan_type: ScanType,
    #[cfg_attr(feature = "serde", serde(default))]
    pub state: PageScanState,
    pub min: DateTime<Utc>,
    pub max: DateTime<Utc>,
    pub url: String,
    pub commit_timestamp: DateTime<Utc>,
}

/// A single leaf awaiting its driver.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LeafScan {
    pub scan_id: ScanId,
    pub page_id: PageId,
    pub leaf_id: LeafId,
    pub scan_type: ScanType,
    pub url: String,
    pub leaf_type: LeafType,
    pub item_id: String,
    pub item_version: String,
    pub commit_timestamp: DateTime<Utc>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub attempt_count: u32,
}

impl LeafScan {
    pub fn from_item(
        page: &PageScan,
        leaf_id: LeafId,
        item: &CatalogLeafItem,
    ) -> Self {
        Self {
            scan_id: page.scan_id.clone(),
            page_id: page.page_id.clone(),
            leaf_id,
            scan_type: page.scan_type,
            url: item.url.clone(),
            leaf_type: item.leaf_type,
            item_id: item.item_id.clone(),
            item_version: item.item_version.clone(),
            commit_timestamp: item.commit_timestamp,
            attempt_count: 0,
        }
    }

    /// Row key inside the scan's leaf partition.
    pub fn row_key(&self) -> String {
        leaf_row_key(&self.page_id, &self.leaf_id)
    }
}

/// Leaves of a whole scan share one partition; the row key keeps them
/// grouped by page.
pub fn leaf_row_key(page_id: &PageId, leaf_id: &LeafId) -> String {
    format!("{page_id}-{leaf_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_ordered_by_lifecycle() {
        assert!(ScanState::Created < ScanState::Scoped);
        assert!(ScanState::Enqueued < ScanState::Complete);
        assert_eq!("Expanded".parse::<ScanState>().unwrap(), ScanState::Expanded);
    }

    #[test]
    fn scan_types_parse_loosely() {
        assert_eq!(
            "latest_leaves".parse::<ScanType>().unwrap(),
            ScanType::LatestLeaves
        );
        assert_eq!(
            "Leaf-Details".parse::<ScanType>().unwrap(),
            ScanType::LeafDetails
        );
        assert!("nope".parse::<ScanType>().is_err());
    }

    #[test]
    fn page_modes_per_type() {
        assert_eq!(ScanType::WarmPages.page_mode(), PageMode::DownloadOnly);
        assert_eq!(
            ScanType::LatestLeaves.page_mode(),
            PageMode::DirectAggregation
        );
        assert_eq!(ScanType::LeafDetails.page_mode(), PageMode::FanOut);
        assert!(!ScanType::WarmPages.supports_cursor());
    }
}
