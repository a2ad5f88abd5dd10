//! The scan pipeline: index, page and leaf processors over the scan tables.

pub mod cursor;
pub mod driver;
pub mod latest;
pub mod lease;
pub mod leaf;
pub mod orchestrator;
pub mod page;
pub mod service;
pub mod storage;

pub use cursor::{CursorRecord, CursorStore, TableCursorStore};
pub use driver::{
    DriverRegistry, LatestLeavesDriver, LeafDetailsDriver, LeafOutcome, ScanDriver,
    WarmPagesDriver,
};
pub use latest::{LatestItemRecord, LatestItemResolver, MergeSummary};
pub use lease::{LeaseGuard, LeaseService};
pub use leaf::LeafScanProcessor;
pub use orchestrator::{COMPLETION_POLL_DELAY, IndexScanProcessor};
pub use page::PageScanProcessor;
pub use service::{
    CatalogScanService, RequeueSummary, ScanStatus, StartOutcome, StartScanRequest,
};
pub use storage::ScanStorageService;
