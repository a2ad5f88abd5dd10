//! Typed access to the three scan record kinds.
//!
//! Layout:
//! - index scans: partition = cursor name (empty for ad-hoc), row = scan id
//! - page scans: partition = scan id, row = page id
//! - leaf scans: partition = scan id, row = `{page id}-{leaf id}`

use std::fmt;
use std::sync::Arc;

use feedscan_model::{
    IndexScan, LeafId, LeafScan, PageId, PageScan, ScanId, leaf_row_key,
};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Result, ScanError};
use crate::store::{
    BatchOperation, RowRange, TableStore, Versioned, query_all,
};

pub const INDEX_SCAN_TABLE: &str = "index_scans";
pub const PAGE_SCAN_TABLE: &str = "page_scans";
pub const LEAF_SCAN_TABLE: &str = "leaf_scans";

#[derive(Clone)]
pub struct ScanStorageService {
    store: Arc<dyn TableStore>,
    page_size: usize,
}

impl fmt::Debug for ScanStorageService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanStorageService")
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl ScanStorageService {
    pub fn new(store: Arc<dyn TableStore>, page_size: usize) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn TableStore> {
        &self.store
    }

    pub async fn initialize(&self) -> Result<()> {
        self.store.initialize().await
    }

    // Index scans

    pub async fn insert_index_scan(
        &self,
        scan: &IndexScan,
    ) -> Result<Versioned<IndexScan>> {
        let etag = self
            .store
            .insert(
                INDEX_SCAN_TABLE,
                &scan.cursor_name,
                scan.scan_id.as_str(),
                serde_json::to_value(scan)?,
            )
            .await?;
        Ok(Versioned {
            record: scan.clone(),
            etag,
        })
    }

    pub async fn get_index_scan(
        &self,
        cursor_name: &str,
        scan_id: &ScanId,
    ) -> Result<Option<Versioned<IndexScan>>> {
        self.get_versioned(INDEX_SCAN_TABLE, cursor_name, scan_id.as_str())
            .await
    }

    /// Conditional on the etag the scan was read at.
    pub async fn replace_index_scan(
        &self,
        scan: &Versioned<IndexScan>,
    ) -> Result<Versioned<IndexScan>> {
        let etag = self
            .store
            .replace(
                INDEX_SCAN_TABLE,
                &scan.record.cursor_name,
                scan.record.scan_id.as_str(),
                serde_json::to_value(&scan.record)?,
                &scan.etag,
            )
            .await?;
        Ok(Versioned {
            record: scan.record.clone(),
            etag,
        })
    }

    /// Newest scans of a cursor first, thanks to descending scan ids.
    pub async fn latest_index_scans(
        &self,
        cursor_name: &str,
        limit: usize,
    ) -> Result<Vec<IndexScan>> {
        let page = self
            .store
            .query(INDEX_SCAN_TABLE, cursor_name, &RowRange::all(), limit, None)
            .await?;
        page.rows.iter().map(|row| row.decode()).collect()
    }

    // Page scans

    pub async fn insert_page_scans(&self, pages: &[PageScan]) -> Result<()> {
        self.insert_children(
            PAGE_SCAN_TABLE,
            pages,
            |page| &page.scan_id,
            |page| page.page_id.as_str().to_string(),
        )
        .await
    }

    pub async fn get_page_scan(
        &self,
        scan_id: &ScanId,
        page_id: &PageId,
    ) -> Result<Option<Versioned<PageScan>>> {
        self.get_versioned(PAGE_SCAN_TABLE, scan_id.as_str(), page_id.as_str())
            .await
    }

    /// Conditional on the etag the page was read at. A deleted row fails
    /// the same way as a stale etag.
    pub async fn replace_page_scan(
        &self,
        page: &Versioned<PageScan>,
    ) -> Result<Versioned<PageScan>> {
        let etag = self
            .store
            .replace(
                PAGE_SCAN_TABLE,
                page.record.scan_id.as_str(),
                page.record.page_id.as_str(),
                serde_json::to_value(&page.record)?,
                &page.etag,
            )
            .await?;
        Ok(Versioned {
            record: page.record.clone(),
            etag,
        })
    }

    /// Every remaining page of a scan, ordered by page id.
    pub async fn list_page_scans(&self, scan_id: &ScanId) -> Result<Vec<PageScan>> {
        let rows = query_all(
            self.store.as_ref(),
            PAGE_SCAN_TABLE,
            scan_id.as_str(),
            &RowRange::all(),
            self.page_size,
        )
        .await?;
        rows.iter().map(|row| row.decode()).collect()
    }

    /// Returns whether the row still existed. Fails with
    /// [`ScanError::VersionConflict`] when the row moved past `page.etag`.
    pub async fn delete_page_scan(&self, page: &Versioned<PageScan>) -> Result<bool> {
        self.store
            .delete(
                PAGE_SCAN_TABLE,
                page.record.scan_id.as_str(),
                page.record.page_id.as_str(),
                Some(&page.etag),
            )
            .await
    }

    pub async fn page_count_lower_bound(&self, scan_id: &ScanId) -> Result<usize> {
        self.count_lower_bound(PAGE_SCAN_TABLE, scan_id.as_str()).await
    }

    // Leaf scans

    pub async fn insert_leaf_scans(&self, leaves: &[LeafScan]) -> Result<()> {
        self.insert_children(
            LEAF_SCAN_TABLE,
            leaves,
            |leaf| &leaf.scan_id,
            LeafScan::row_key,
        )
        .await
    }

    pub async fn get_leaf_scan(
        &self,
        scan_id: &ScanId,
        page_id: &PageId,
        leaf_id: &LeafId,
    ) -> Result<Option<Versioned<LeafScan>>> {
        self.get_versioned(
            LEAF_SCAN_TABLE,
            scan_id.as_str(),
            &leaf_row_key(page_id, leaf_id),
        )
        .await
    }

    pub async fn replace_leaf_scan(
        &self,
        leaf: &Versioned<LeafScan>,
    ) -> Result<Versioned<LeafScan>> {
        let etag = self
            .store
            .replace(
                LEAF_SCAN_TABLE,
                leaf.record.scan_id.as_str(),
                &leaf.record.row_key(),
                serde_json::to_value(&leaf.record)?,
                &leaf.etag,
            )
            .await?;
        Ok(Versioned {
            record: leaf.record.clone(),
            etag,
        })
    }

    /// Remaining leaves of a scan, optionally restricted to one page.
    pub async fn list_leaf_scans(
        &self,
        scan_id: &ScanId,
        page_id: Option<&PageId>,
    ) -> Result<Vec<LeafScan>> {
        let range = match page_id {
            Some(page_id) => {
                RowRange::between(format!("{page_id}-"), format!("{page_id}-~"))
            }
            None => RowRange::all(),
        };
        let rows = query_all(
            self.store.as_ref(),
            LEAF_SCAN_TABLE,
            scan_id.as_str(),
            &range,
            self.page_size,
        )
        .await?;
        rows.iter().map(|row| row.decode()).collect()
    }

    pub async fn delete_leaf_scan(&self, leaf: &LeafScan) -> Result<bool> {
        self.store
            .delete(
                LEAF_SCAN_TABLE,
                leaf.scan_id.as_str(),
                &leaf.row_key(),
                None,
            )
            .await
    }

    pub async fn leaf_count_lower_bound(&self, scan_id: &ScanId) -> Result<usize> {
        self.count_lower_bound(LEAF_SCAN_TABLE, scan_id.as_str()).await
    }

    /// Pages first, then leaves: non-zero as soon as either partition has a
    /// row.
    pub async fn child_count_lower_bound(&self, scan_id: &ScanId) -> Result<usize> {
        let pages = self.page_count_lower_bound(scan_id).await?;
        if pages > 0 {
            return Ok(pages);
        }
        self.leaf_count_lower_bound(scan_id).await
    }

    /// Size of the first query page: never zero while a row exists, never
    /// more than the page size.
    async fn count_lower_bound(&self, table: &str, partition_key: &str) -> Result<usize> {
        let page = self
            .store
            .query(table, partition_key, &RowRange::all(), self.page_size, None)
            .await?;
        Ok(page.rows.len())
    }

    async fn get_versioned<T: DeserializeOwned>(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<Versioned<T>>> {
        self.store
            .get(table, partition_key, row_key)
            .await?
            .map(|row| Versioned::from_row(&row))
            .transpose()
    }

    async fn insert_children<T, P, R>(
        &self,
        table: &str,
        records: &[T],
        parent: P,
        row_key: R,
    ) -> Result<()>
    where
        T: Serialize,
        P: Fn(&T) -> &ScanId,
        R: Fn(&T) -> String,
    {
        let Some(first) = records.first() else {
            return Ok(());
        };
        let scan_id = parent(first);
        if records.iter().any(|r| parent(r) != scan_id) {
            return Err(ScanError::InvalidRequest(format!(
                "{table} batch spans more than one scan"
            )));
        }

        let batch_size = self.store.max_batch_size().max(1);
        for chunk in records.chunks(batch_size) {
            let operations = chunk
                .iter()
                .map(|record| BatchOperation::insert(row_key(record), record))
                .collect::<Result<Vec<_>>>()?;
            self.store
                .execute_batch(table, scan_id.as_str(), operations)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryTableStore;
    use chrono::{TimeZone, Utc};
    use feedscan_model::{LeafType, PageScanState, ScanType};

    fn page(scan: &str, rank: usize) -> PageScan {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        PageScan {
            scan_id: ScanId(scan.into()),
            page_id: PageId::from_rank(rank),
            scan_type: ScanType::LatestLeaves,
            state: PageScanState::Created,
            min: at,
            max: at,
            url: format!("https://feed.test/page{rank}.json"),
            commit_timestamp: at,
        }
    }

    fn leaf(page: &PageScan, rank: usize) -> LeafScan {
        LeafScan {
            scan_id: page.scan_id.clone(),
            page_id: page.page_id.clone(),
            leaf_id: LeafId::from_rank(rank),
            scan_type: ScanType::LeafDetails,
            url: format!("{}#{rank}", page.url),
            leaf_type: LeafType::Details,
            item_id: format!("item{rank}"),
            item_version: "1.0.0".into(),
            commit_timestamp: page.commit_timestamp,
            attempt_count: 0,
        }
    }

    fn service(page_size: usize, batch: usize) -> ScanStorageService {
        ScanStorageService::new(Arc::new(InMemoryTableStore::new(batch)), page_size)
    }

    #[tokio::test]
    async fn lower_bound_is_zero_only_when_empty() {
        let storage = service(3, 2);
        let scan = ScanId("s".into());
        assert_eq!(storage.page_count_lower_bound(&scan).await.unwrap(), 0);

        let pages: Vec<_> = (0..7).map(|i| page("s", i)).collect();
        storage.insert_page_scans(&pages).await.unwrap();
        assert_eq!(storage.page_count_lower_bound(&scan).await.unwrap(), 3);

        for (i, p) in pages.iter().enumerate() {
            let stored = storage.get_page_scan(&scan, &p.page_id).await.unwrap().unwrap();
            assert!(storage.delete_page_scan(&stored).await.unwrap());
            let remaining = storage.page_count_lower_bound(&scan).await.unwrap();
            assert_eq!(remaining == 0, i == pages.len() - 1);
        }
    }

    #[tokio::test]
    async fn page_writes_are_guarded_by_etag() {
        let storage = service(10, 10);
        let scan = ScanId("s".into());
        let p = page("s", 0);
        storage.insert_page_scans(std::slice::from_ref(&p)).await.unwrap();

        let stale = storage.get_page_scan(&scan, &p.page_id).await.unwrap().unwrap();
        let mut claimed = stale.clone();
        claimed.record.state = PageScanState::Expanding;
        let claimed = storage.replace_page_scan(&claimed).await.unwrap();

        let err = storage.replace_page_scan(&stale).await.unwrap_err();
        assert!(err.is_write_conflict());
        let err = storage.delete_page_scan(&stale).await.unwrap_err();
        assert!(err.is_write_conflict());

        let current = storage.get_page_scan(&scan, &p.page_id).await.unwrap().unwrap();
        assert_eq!(current.record.state, PageScanState::Expanding);
        assert!(storage.delete_page_scan(&claimed).await.unwrap());
        assert!(!storage.delete_page_scan(&claimed).await.unwrap());
        assert!(storage.replace_page_scan(&claimed).await.unwrap_err().is_write_conflict());
    }

    #[tokio::test]
    async fn batch_insert_chunks_and_lists_in_order() {
        let storage = service(2, 2);
        let pages: Vec<_> = (0..5).rev().map(|i| page("s", i)).collect();
        storage.insert_page_scans(&pages).await.unwrap();

        let listed = storage.list_page_scans(&ScanId("s".into())).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|p| p.page_id.clone()).collect();
        assert_eq!(ids, (0..5).map(PageId::from_rank).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn rejects_children_of_mixed_scans() {
        let storage = service(10, 10);
        let err = storage
            .insert_page_scans(&[page("a", 0), page("b", 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn leaves_list_per_page_and_count_toward_children() {
        let storage = service(10, 10);
        let first = page("s", 0);
        let second = page("s", 1);
        let leaves: Vec<_> = (0..3)
            .map(|i| leaf(&first, i))
            .chain((0..2).map(|i| leaf(&second, i)))
            .collect();
        storage.insert_leaf_scans(&leaves).await.unwrap();

        let scan = ScanId("s".into());
        assert_eq!(
            storage.list_leaf_scans(&scan, Some(&second.page_id)).await.unwrap().len(),
            2
        );
        assert_eq!(storage.list_leaf_scans(&scan, None).await.unwrap().len(), 5);
        assert_eq!(storage.child_count_lower_bound(&scan).await.unwrap(), 5);

        let loaded = storage
            .get_leaf_scan(&scan, &first.page_id, &LeafId::from_rank(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.record.item_id, "item2");
    }
}
