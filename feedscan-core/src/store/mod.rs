//! Partitioned key-value table storage.
//!
//! Rows are addressed by `(table, partition key, row key)` and carry an
//! opaque etag that changes on every write. Writes are guarded either by
//! "row must not exist" (insert) or by the caller's etag (replace/delete);
//! those guards are the only concurrency control the pipeline relies on.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Result, ScanError};

pub use memory::InMemoryTableStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresTableStore;

/// A stored row as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub partition_key: String,
    pub row_key: String,
    pub etag: String,
    pub value: Value,
}

impl TableRow {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.value.clone())?)
    }
}

/// A typed record together with the etag it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub record: T,
    pub etag: String,
}

impl<T: DeserializeOwned> Versioned<T> {
    pub fn from_row(row: &TableRow) -> Result<Self> {
        Ok(Self {
            record: row.decode()?,
            etag: row.etag.clone(),
        })
    }
}

/// One write inside an atomic batch. All operations of a batch target the
/// same partition.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOperation {
    Insert {
        row_key: String,
        value: Value,
    },
    Replace {
        row_key: String,
        value: Value,
        etag: String,
    },
    Delete {
        row_key: String,
        etag: Option<String>,
    },
}

impl BatchOperation {
    pub fn insert<T: Serialize>(row_key: impl Into<String>, value: &T) -> Result<Self> {
        Ok(BatchOperation::Insert {
            row_key: row_key.into(),
            value: serde_json::to_value(value)?,
        })
    }

    pub fn replace<T: Serialize>(
        row_key: impl Into<String>,
        value: &T,
        etag: impl Into<String>,
    ) -> Result<Self> {
        Ok(BatchOperation::Replace {
            row_key: row_key.into(),
            value: serde_json::to_value(value)?,
            etag: etag.into(),
        })
    }

    pub fn row_key(&self) -> &str {
        match self {
            BatchOperation::Insert { row_key, .. }
            | BatchOperation::Replace { row_key, .. }
            | BatchOperation::Delete { row_key, .. } => row_key,
        }
    }
}

/// Inclusive row-key bounds; `None` leaves that side open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

impl RowRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: Some(start.into()),
            end: Some(end.into()),
        }
    }
}

/// One page of a range query. A continuation is returned whenever the page
/// came back full; passing it to the next query resumes after the last row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowPage {
    pub rows: Vec<TableRow>,
    pub continuation: Option<String>,
}

#[async_trait]
pub trait TableStore: Send + Sync {
    /// Prepare backing storage. Safe to call repeatedly.
    async fn initialize(&self) -> Result<()>;

    /// Largest number of operations `execute_batch` accepts.
    fn max_batch_size(&self) -> usize;

    async fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<TableRow>>;

    /// Fails with [`ScanError::AlreadyExists`] when the row is present.
    async fn insert(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        value: Value,
    ) -> Result<String>;

    /// Fails with [`ScanError::VersionConflict`] unless the stored etag
    /// matches `etag`.
    async fn replace(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        value: Value,
        etag: &str,
    ) -> Result<String>;

    /// Returns whether a row was removed. A missing row is not an error; an
    /// etag mismatch is.
    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        etag: Option<&str>,
    ) -> Result<bool>;

    /// Rows of one partition within `range`, ascending by row key, at most
    /// `limit` of them.
    async fn query(
        &self,
        table: &str,
        partition_key: &str,
        range: &RowRange,
        limit: usize,
        continuation: Option<&str>,
    ) -> Result<RowPage>;

    /// Apply every operation or none. Returns the new etag for inserts and
    /// replaces, `None` for deletes, in operation order.
    async fn execute_batch(
        &self,
        table: &str,
        partition_key: &str,
        operations: Vec<BatchOperation>,
    ) -> Result<Vec<Option<String>>>;
}

/// Drain a range query, following continuations.
pub async fn query_all(
    store: &dyn TableStore,
    table: &str,
    partition_key: &str,
    range: &RowRange,
    page_size: usize,
) -> Result<Vec<TableRow>> {
    let mut rows = Vec::new();
    let mut continuation: Option<String> = None;
    loop {
        let page = store
            .query(
                table,
                partition_key,
                range,
                page_size,
                continuation.as_deref(),
            )
            .await?;
        rows.extend(page.rows);
        match page.continuation {
            Some(next) => continuation = Some(next),
            None => return Ok(rows),
        }
    }
}

/// Shared batch validation for store implementations.
pub(crate) fn validate_batch(
    operations: &[BatchOperation],
    max_batch_size: usize,
) -> Result<()> {
    if operations.len() > max_batch_size {
        return Err(ScanError::InvalidBatch(format!(
            "{} operations exceed the batch limit of {}",
            operations.len(),
            max_batch_size
        )));
    }
    let mut seen = std::collections::HashSet::new();
    for op in operations {
        if !seen.insert(op.row_key()) {
            return Err(ScanError::InvalidBatch(format!(
                "row key {} appears more than once",
                op.row_key()
            )));
        }
    }
    Ok(())
}

pub(crate) fn new_etag() -> String {
    uuid::Uuid::new_v4().to_string()
}
