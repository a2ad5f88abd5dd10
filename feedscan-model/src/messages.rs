//! Queue payloads. They carry identifiers only; everything mutable lives in
//! the scan tables.

use crate::ids::{LeafId, PageId, ScanId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IndexScanMessage {
    pub cursor_name: String,
    pub scan_id: ScanId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PageScanMessage {
    pub scan_id: ScanId,
    pub page_id: PageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LeafScanMessage {
    pub scan_id: ScanId,
    pub page_id: PageId,
    pub leaf_id: LeafId,
}
