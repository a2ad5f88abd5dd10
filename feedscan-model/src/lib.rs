//! Plain data shared by the feedscan crates: scan records, queue payloads
//! and the feed documents they are derived from.
#![allow(missing_docs)]

pub use ::chrono;

pub mod error;
pub mod feed;
pub mod ids;
pub mod messages;
pub mod scan;

pub use error::{ModelError, Result as ModelResult};
pub use feed::{CatalogIndex, CatalogLeafItem, CatalogPage, CatalogPageItem, LeafType};
pub use ids::{LeafId, PageId, ScanId};
pub use messages::{IndexScanMessage, LeafScanMessage, PageScanMessage};
pub use scan::{
    IndexScan, LeafScan, PageMode, PageScan, PageScanState, ScanState, ScanType, leaf_row_key,
};
