use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ModelError;

/// Identifier of one index scan.
///
/// Generated ids sort newest-first: the prefix is the number of
/// microseconds remaining until `i64::MAX`, zero padded, so a plain
/// ascending range query over a cursor partition yields the latest scans
/// first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ScanId(pub String);

impl Default for ScanId {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanId {
    pub fn new() -> Self {
        Self::descending_at(Utc::now())
    }

    pub fn descending_at(at: DateTime<Utc>) -> Self {
        let remaining = i64::MAX - at.timestamp_micros().max(0);
        let unique = Uuid::new_v4().simple().to_string();
        ScanId(format!("{remaining:019}-{}", &unique[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ScanId {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.contains('/') {
            return Err(ModelError::InvalidIdentifier(s.to_string()));
        }
        Ok(ScanId(trimmed.to_string()))
    }
}

/// Rank-derived identifier of a page within one scan. `P` followed by the
/// page's zero padded rank in (commit timestamp, url) order, so identifiers
/// sort the same way the pages do.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct PageId(pub String);

impl PageId {
    pub fn from_rank(rank: usize) -> Self {
        PageId(format!("P{rank:010}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rank-derived identifier of a leaf within one page, `L` plus the zero
/// padded rank of the item inside its page document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct LeafId(pub String);

impl LeafId {
    pub fn from_rank(rank: usize) -> Self {
        LeafId(format!("L{rank:010}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeafId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
