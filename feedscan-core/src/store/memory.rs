use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{
    BatchOperation, RowPage, RowRange, TableRow, TableStore, new_etag,
    validate_batch,
};
use crate::error::{Result, ScanError};

#[derive(Debug, Clone)]
struct StoredRow {
    etag: String,
    value: Value,
}

type Partition = BTreeMap<String, StoredRow>;
type PartitionKey = (String, String);

/// Table store kept in process memory. Useful for tests and for embedding
/// the pipeline without a database.
#[derive(Clone)]
pub struct InMemoryTableStore {
    partitions: Arc<Mutex<HashMap<PartitionKey, Partition>>>,
    max_batch_size: usize,
    queries: Arc<AtomicUsize>,
}

impl std::fmt::Debug for InMemoryTableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTableStore")
            .field("max_batch_size", &self.max_batch_size)
            .field("queries", &self.queries.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for InMemoryTableStore {
    fn default() -> Self {
        Self::new(100)
    }
}

impl InMemoryTableStore {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            partitions: Arc::new(Mutex::new(HashMap::new())),
            max_batch_size,
            queries: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of range-query pages served so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }

    /// Number of rows currently stored in one partition.
    pub async fn partition_len(&self, table: &str, partition_key: &str) -> usize {
        let partitions = self.partitions.lock().await;
        partitions
            .get(&(table.to_string(), partition_key.to_string()))
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

fn key(table: &str, partition_key: &str) -> PartitionKey {
    (table.to_string(), partition_key.to_string())
}

fn to_row(partition_key: &str, row_key: &str, stored: &StoredRow) -> TableRow {
    TableRow {
        partition_key: partition_key.to_string(),
        row_key: row_key.to_string(),
        etag: stored.etag.clone(),
        value: stored.value.clone(),
    }
}

fn already_exists(table: &str, partition_key: &str, row_key: &str) -> ScanError {
    ScanError::AlreadyExists {
        table: table.to_string(),
        partition_key: partition_key.to_string(),
        row_key: row_key.to_string(),
    }
}

fn conflict(table: &str, partition_key: &str, row_key: &str) -> ScanError {
    ScanError::VersionConflict {
        table: table.to_string(),
        partition_key: partition_key.to_string(),
        row_key: row_key.to_string(),
    }
}

#[async_trait]
impl TableStore for InMemoryTableStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<TableRow>> {
        let partitions = self.partitions.lock().await;
        Ok(partitions
            .get(&key(table, partition_key))
            .and_then(|p| p.get(row_key))
            .map(|stored| to_row(partition_key, row_key, stored)))
    }

    async fn insert(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        value: Value,
    ) -> Result<String> {
        let mut partitions = self.partitions.lock().await;
        let partition = partitions.entry(key(table, partition_key)).or_default();
        if partition.contains_key(row_key) {
            return Err(already_exists(table, partition_key, row_key));
        }
        let etag = new_etag();
        partition.insert(
            row_key.to_string(),
            StoredRow {
                etag: etag.clone(),
                value,
            },
        );
        Ok(etag)
    }

    async fn replace(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        value: Value,
        etag: &str,
    ) -> Result<String> {
        let mut partitions = self.partitions.lock().await;
        let stored = partitions
            .get_mut(&key(table, partition_key))
            .and_then(|p| p.get_mut(row_key))
            .filter(|stored| stored.etag == etag)
            .ok_or_else(|| conflict(table, partition_key, row_key))?;
        stored.etag = new_etag();
        stored.value = value;
        Ok(stored.etag.clone())
    }

    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        etag: Option<&str>,
    ) -> Result<bool> {
        let mut partitions = self.partitions.lock().await;
        let Some(partition) = partitions.get_mut(&key(table, partition_key))
        else {
            return Ok(false);
        };
        match (partition.get(row_key), etag) {
            (None, _) => Ok(false),
            (Some(stored), Some(expected)) if stored.etag != expected => {
                Err(conflict(table, partition_key, row_key))
            }
            (Some(_), _) => {
                partition.remove(row_key);
                Ok(true)
            }
        }
    }

    async fn query(
        &self,
        table: &str,
        partition_key: &str,
        range: &RowRange,
        limit: usize,
        continuation: Option<&str>,
    ) -> Result<RowPage> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let partitions = self.partitions.lock().await;
        let Some(partition) = partitions.get(&key(table, partition_key)) else {
            return Ok(RowPage::default());
        };

        let lower = match (continuation, range.start.as_deref()) {
            (Some(after), Some(start)) if start > after => Bound::Included(start.to_string()),
            (Some(after), _) => Bound::Excluded(after.to_string()),
            (None, Some(start)) => Bound::Included(start.to_string()),
            (None, None) => Bound::Unbounded,
        };
        let limit = limit.max(1);
        let rows: Vec<TableRow> = partition
            .range((lower, Bound::Unbounded))
            .take_while(|(row_key, _)| {
                range.end.as_deref().is_none_or(|end| row_key.as_str() <= end)
            })
            .take(limit)
            .map(|(row_key, stored)| to_row(partition_key, row_key, stored))
            .collect();

        let continuation = if rows.len() == limit {
            rows.last().map(|row| row.row_key.clone())
        } else {
            None
        };
        Ok(RowPage { rows, continuation })
    }

    async fn execute_batch(
        &self,
        table: &str,
        partition_key: &str,
        operations: Vec<BatchOperation>,
    ) -> Result<Vec<Option<String>>> {
        validate_batch(&operations, self.max_batch_size)?;
        let mut partitions = self.partitions.lock().await;
        let partition = partitions.entry(key(table, partition_key)).or_default();

        // Check every guard before touching anything so the batch is atomic.
        for op in &operations {
            match op {
                BatchOperation::Insert { row_key, .. } => {
                    if partition.contains_key(row_key) {
                        return Err(already_exists(table, partition_key, row_key));
                    }
                }
                BatchOperation::Replace { row_key, etag, .. } => {
                    if partition.get(row_key).is_none_or(|s| &s.etag != etag) {
                        return Err(conflict(table, partition_key, row_key));
                    }
                }
                BatchOperation::Delete { row_key, etag } => {
                    let stored = partition.get(row_key);
                    match (stored, etag) {
                        (None, _) => {
                            return Err(ScanError::NotFound(format!(
                                "{table}/{partition_key}/{row_key}"
                            )));
                        }
                        (Some(stored), Some(expected)) if &stored.etag != expected => {
                            return Err(conflict(table, partition_key, row_key));
                        }
                        _ => {}
                    }
                }
            }
        }

        let mut etags = Vec::with_capacity(operations.len());
        for op in operations {
            match op {
                BatchOperation::Insert { row_key, value }
                | BatchOperation::Replace { row_key, value, .. } => {
                    let etag = new_etag();
                    partition.insert(
                        row_key,
                        StoredRow {
                            etag: etag.clone(),
                            value,
                        },
                    );
                    etags.push(Some(etag));
                }
                BatchOperation::Delete { row_key, .. } => {
                    partition.remove(&row_key);
                    etags.push(None);
                }
            }
        }
        Ok(etags)
    }
}
