//! Conflict-resolved "latest observed state per item" table.
//!
//! A merge groups incoming items per partition, reads every existing row
//! of the affected key range with one paged range query, then writes
//! inserts and etag-guarded replaces in atomic batches. Losing a write race
//! re-runs the partition from the read step; items already written by the
//! losing attempt come back as equal timestamps and are skipped.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use feedscan_model::CatalogLeafItem;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::error::Result;
use crate::store::{BatchOperation, RowRange, TableStore, query_all};

/// The stored state of one item. `commit_timestamp` only ever increases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestItemRecord {
    pub partition_key: String,
    pub row_key: String,
    pub commit_timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl LatestItemRecord {
    pub fn new(
        partition_key: impl Into<String>,
        row_key: impl Into<String>,
        commit_timestamp: DateTime<Utc>,
        payload: Value,
    ) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            commit_timestamp,
            payload,
        }
    }

    /// Keyed by lowercase item id (partition) and version (row).
    pub fn from_leaf_item(item: &CatalogLeafItem) -> Result<Self> {
        let (id, version) = item.natural_key();
        Ok(Self::new(
            id,
            version,
            item.commit_timestamp,
            serde_json::to_value(item)?,
        ))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeSummary {
    pub inserted: usize,
    pub replaced: usize,
    /// Incoming items older than, or as old as, what was stored.
    pub skipped: usize,
    /// Partition attempts repeated after a write conflict.
    pub retries: usize,
}

impl MergeSummary {
    fn absorb(&mut self, other: MergeSummary) {
        self.inserted += other.inserted;
        self.replaced += other.replaced;
        self.skipped += other.skipped;
        self.retries += other.retries;
    }
}

#[derive(Clone)]
pub struct LatestItemResolver {
    store: Arc<dyn TableStore>,
    table: String,
    page_size: usize,
    max_attempts: u32,
}

impl fmt::Debug for LatestItemResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LatestItemResolver")
            .field("table", &self.table)
            .field("page_size", &self.page_size)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl LatestItemResolver {
    pub fn new(
        store: Arc<dyn TableStore>,
        table: impl Into<String>,
        config: &StorageConfig,
    ) -> Self {
        Self {
            store,
            table: table.into(),
            page_size: config.query_page_size.max(1),
            max_attempts: config.merge_retry_attempts.max(1),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn get(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<LatestItemRecord>> {
        self.store
            .get(&self.table, partition_key, row_key)
            .await?
            .map(|row| row.decode())
            .transpose()
    }

    /// Merge `items` so each key ends up holding the item with the greatest
    /// commit timestamp ever merged for it. Ties keep what is stored.
    pub async fn merge(&self, items: Vec<LatestItemRecord>) -> Result<MergeSummary> {
        let mut partitions: BTreeMap<String, BTreeMap<String, LatestItemRecord>> =
            BTreeMap::new();
        for item in items {
            let partition = partitions.entry(item.partition_key.clone()).or_default();
            match partition.get(&item.row_key) {
                Some(kept) if kept.commit_timestamp >= item.commit_timestamp => {}
                _ => {
                    partition.insert(item.row_key.clone(), item);
                }
            }
        }

        let mut summary = MergeSummary::default();
        for (partition_key, items) in &partitions {
            summary.absorb(self.merge_partition(partition_key, items).await?);
        }
        debug!(
            table = %self.table,
            partitions = partitions.len(),
            inserted = summary.inserted,
            replaced = summary.replaced,
            skipped = summary.skipped,
            "merged latest items"
        );
        Ok(summary)
    }

    async fn merge_partition(
        &self,
        partition_key: &str,
        items: &BTreeMap<String, LatestItemRecord>,
    ) -> Result<MergeSummary> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_merge_partition(partition_key, items).await {
                Ok(mut summary) => {
                    summary.retries = (attempt - 1) as usize;
                    return Ok(summary);
                }
                Err(err) if err.is_write_conflict() && attempt < self.max_attempts => {
                    warn!(
                        table = %self.table,
                        partition = %partition_key,
                        attempt,
                        error = %err,
                        "latest item write conflict, re-reading partition"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_merge_partition(
        &self,
        partition_key: &str,
        items: &BTreeMap<String, LatestItemRecord>,
    ) -> Result<MergeSummary> {
        let (Some(first), Some(last)) = (items.keys().next(), items.keys().next_back())
        else {
            return Ok(MergeSummary::default());
        };

        let existing_rows = query_all(
            self.store.as_ref(),
            &self.table,
            partition_key,
            &RowRange::between(first.as_str(), last.as_str()),
            self.page_size,
        )
        .await?;
        let mut existing: HashMap<String, (DateTime<Utc>, String)> =
            HashMap::with_capacity(existing_rows.len());
        for row in existing_rows {
            let record: LatestItemRecord = row.decode()?;
            existing.insert(row.row_key, (record.commit_timestamp, row.etag));
        }

        let mut summary = MergeSummary::default();
        let mut operations = Vec::new();
        for (row_key, item) in items {
            match existing.get(row_key) {
                None => {
                    operations.push(BatchOperation::insert(row_key.as_str(), item)?);
                    summary.inserted += 1;
                }
                Some((stored, _)) if *stored >= item.commit_timestamp => {
                    summary.skipped += 1;
                }
                Some((_, etag)) => {
                    operations.push(BatchOperation::replace(
                        row_key.as_str(),
                        item,
                        etag.as_str(),
                    )?);
                    summary.replaced += 1;
                }
            }
        }

        let batch_size = self.store.max_batch_size().max(1);
        let mut operations = operations.into_iter().peekable();
        while operations.peek().is_some() {
            let batch: Vec<_> = operations.by_ref().take(batch_size).collect();
            self.store
                .execute_batch(&self.table, partition_key, batch)
                .await?;
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScanError;
    use crate::store::{InMemoryTableStore, RowPage, TableRow};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    fn item(key: usize, d: u32, label: &str) -> LatestItemRecord {
        LatestItemRecord::new("p", key.to_string(), day(d), json!({ "label": label }))
    }

    fn resolver(store: &InMemoryTableStore, page_size: usize) -> LatestItemResolver {
        LatestItemResolver::new(
            Arc::new(store.clone()),
            "latest",
            &StorageConfig {
                query_page_size: page_size,
                ..StorageConfig::default()
            },
        )
    }

    async fn labels(resolver: &LatestItemResolver, keys: usize) -> Vec<String> {
        let mut out = Vec::new();
        for key in 0..keys {
            let record = resolver.get("p", &key.to_string()).await.unwrap().unwrap();
            out.push(record.payload["label"].as_str().unwrap().to_string());
        }
        out
    }

    #[tokio::test]
    async fn newer_stored_rows_survive_older_incoming_items() {
        let store = InMemoryTableStore::default();
        let resolver = resolver(&store, 1_000);
        resolver
            .merge(vec![item(2, 2, "a"), item(4, 2, "a")])
            .await
            .unwrap();

        let summary = resolver
            .merge((0..7).map(|k| item(k, 1, "b")).collect())
            .await
            .unwrap();

        assert_eq!(labels(&resolver, 7).await, vec!["b", "b", "a", "b", "a", "b", "b"]);
        assert_eq!(summary.inserted, 5);
        assert_eq!(summary.skipped, 2);
    }

    #[tokio::test]
    async fn equal_timestamps_keep_stored_value() {
        let store = InMemoryTableStore::default();
        let resolver = resolver(&store, 2);
        resolver
            .merge((0..5).map(|k| item(k, 3, "stored")).collect())
            .await
            .unwrap();

        for size in [1, 3, 5] {
            resolver
                .merge((0..size).map(|k| item(k, 3, "incoming")).collect())
                .await
                .unwrap();
        }
        assert!(labels(&resolver, 5).await.iter().all(|l| l == "stored"));
    }

    #[tokio::test]
    async fn newest_duplicate_in_a_batch_wins() {
        let store = InMemoryTableStore::default();
        let resolver = resolver(&store, 1_000);
        resolver
            .merge(vec![item(0, 2, "mid"), item(0, 3, "new"), item(0, 1, "old")])
            .await
            .unwrap();
        assert_eq!(labels(&resolver, 1).await, vec!["new"]);
    }

    #[tokio::test]
    async fn large_merge_matches_incremental_merges() {
        let count = 3_200usize;
        let day_of = |k: usize| (k % 5) as u32 + 1;
        let label_of = |k: usize, round: usize| format!("{k}-{round}");

        let bulk_store = InMemoryTableStore::default();
        let bulk = resolver(&bulk_store, 1_000);
        let small_store = InMemoryTableStore::default();
        let small = resolver(&small_store, 1_000);

        // Seed both with half the keys at day 3.
        let seed: Vec<_> = (0..count)
            .step_by(2)
            .map(|k| {
                LatestItemRecord::new("p", format!("{k:05}"), day(3), json!({ "label": "seed" }))
            })
            .collect();
        bulk.merge(seed.clone()).await.unwrap();
        small.merge(seed).await.unwrap();

        let incoming: Vec<_> = (0..count)
            .map(|k| {
                LatestItemRecord::new(
                    "p",
                    format!("{k:05}"),
                    day(day_of(k)),
                    json!({ "label": label_of(k, 1) }),
                )
            })
            .collect();

        let queries_before = bulk_store.query_count();
        bulk.merge(incoming.clone()).await.unwrap();
        assert!(bulk_store.query_count() - queries_before >= 2);

        for chunk in incoming.chunks(250) {
            small.merge(chunk.to_vec()).await.unwrap();
        }

        for k in 0..count {
            let key = format!("{k:05}");
            let a = bulk.get("p", &key).await.unwrap().unwrap();
            let b = small.get("p", &key).await.unwrap().unwrap();
            assert_eq!(a.payload, b.payload, "key {key}");
            let expected = if k % 2 == 0 && day_of(k) <= 3 {
                json!({ "label": "seed" })
            } else {
                json!({ "label": label_of(k, 1) })
            };
            assert_eq!(a.payload, expected, "key {key}");
        }
    }

    /// Lets another writer update a row right after the first range read.
    struct RacingStore {
        inner: InMemoryTableStore,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl TableStore for RacingStore {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }

        fn max_batch_size(&self) -> usize {
            self.inner.max_batch_size()
        }

        async fn get(&self, t: &str, p: &str, r: &str) -> Result<Option<TableRow>> {
            self.inner.get(t, p, r).await
        }

        async fn insert(&self, t: &str, p: &str, r: &str, v: Value) -> Result<String> {
            self.inner.insert(t, p, r, v).await
        }

        async fn replace(&self, t: &str, p: &str, r: &str, v: Value, e: &str) -> Result<String> {
            self.inner.replace(t, p, r, v, e).await
        }

        async fn delete(&self, t: &str, p: &str, r: &str, e: Option<&str>) -> Result<bool> {
            self.inner.delete(t, p, r, e).await
        }

        async fn query(
            &self,
            t: &str,
            p: &str,
            range: &RowRange,
            limit: usize,
            continuation: Option<&str>,
        ) -> Result<RowPage> {
            let page = self.inner.query(t, p, range, limit, continuation).await?;
            if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
                let row = self.inner.get(t, p, "1").await?.unwrap();
                let newer = serde_json::to_value(item(1, 9, "racer")).unwrap();
                self.inner.replace(t, p, "1", newer, &row.etag).await?;
            }
            Ok(page)
        }

        async fn execute_batch(
            &self,
            t: &str,
            p: &str,
            ops: Vec<BatchOperation>,
        ) -> Result<Vec<Option<String>>> {
            self.inner.execute_batch(t, p, ops).await
        }
    }

    #[tokio::test]
    async fn conflicting_writer_triggers_a_reread() {
        let inner = InMemoryTableStore::default();
        let seed = resolver(&inner, 1_000);
        seed.merge(vec![item(0, 1, "old"), item(1, 1, "old")]).await.unwrap();

        let racing = Arc::new(RacingStore {
            inner: inner.clone(),
            reads: AtomicUsize::new(0),
        });
        let resolver = LatestItemResolver::new(racing, "latest", &StorageConfig::default());

        let summary = resolver
            .merge(vec![item(0, 5, "mine"), item(1, 5, "mine")])
            .await
            .unwrap();

        assert_eq!(summary.retries, 1);
        assert_eq!(labels(&seed, 2).await, vec!["mine", "racer"]);
    }

    #[tokio::test]
    async fn persistent_conflicts_surface_after_max_attempts() {
        struct AlwaysConflicts(InMemoryTableStore);

        #[async_trait]
        impl TableStore for AlwaysConflicts {
            async fn initialize(&self) -> Result<()> {
                Ok(())
            }
            fn max_batch_size(&self) -> usize {
                100
            }
            async fn get(&self, t: &str, p: &str, r: &str) -> Result<Option<TableRow>> {
                self.0.get(t, p, r).await
            }
            async fn insert(&self, t: &str, p: &str, r: &str, v: Value) -> Result<String> {
                self.0.insert(t, p, r, v).await
            }
            async fn replace(
                &self,
                t: &str,
                p: &str,
                r: &str,
                v: Value,
                e: &str,
            ) -> Result<String> {
                self.0.replace(t, p, r, v, e).await
            }
            async fn delete(&self, t: &str, p: &str, r: &str, e: Option<&str>) -> Result<bool> {
                self.0.delete(t, p, r, e).await
            }
            async fn query(
                &self,
                t: &str,
                p: &str,
                range: &RowRange,
                limit: usize,
                continuation: Option<&str>,
            ) -> Result<RowPage> {
                self.0.query(t, p, range, limit, continuation).await
            }
            async fn execute_batch(
                &self,
                t: &str,
                p: &str,
                _ops: Vec<BatchOperation>,
            ) -> Result<Vec<Option<String>>> {
                Err(ScanError::VersionConflict {
                    table: t.into(),
                    partition_key: p.into(),
                    row_key: "x".into(),
                })
            }
        }

        let store = Arc::new(AlwaysConflicts(InMemoryTableStore::default()));
        let resolver = LatestItemResolver::new(store.clone(), "latest", &StorageConfig::default());
        let err = resolver.merge(vec![item(0, 1, "x")]).await.unwrap_err();
        assert!(matches!(err, ScanError::VersionConflict { .. }));
        assert_eq!(store.0.query_count(), 5);
    }
}
