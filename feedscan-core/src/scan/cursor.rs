//! Named positions in the feed. A cursor records the commit timestamp up to
//! which scans of its name have completed.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, ScanError};
use crate::store::{RowRange, TableStore, Versioned, query_all};

pub const CURSOR_TABLE: &str = "cursors";
const CURSOR_PARTITION: &str = "cursors";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRecord {
    pub name: String,
    pub value: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<CursorRecord>>;

    /// Create or overwrite a cursor.
    async fn set(&self, name: &str, value: DateTime<Utc>) -> Result<CursorRecord>;

    async fn list(&self) -> Result<Vec<CursorRecord>>;
}

/// Cursors kept as rows of the shared table store.
#[derive(Clone)]
pub struct TableCursorStore {
    store: Arc<dyn TableStore>,
}

impl fmt::Debug for TableCursorStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableCursorStore")
            .field("table", &CURSOR_TABLE)
            .finish()
    }
}

impl TableCursorStore {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self { store }
    }

    async fn get_versioned(&self, name: &str) -> Result<Option<Versioned<CursorRecord>>> {
        self.store
            .get(CURSOR_TABLE, CURSOR_PARTITION, name)
            .await?
            .map(|row| Versioned::from_row(&row))
            .transpose()
    }
}

#[async_trait]
impl CursorStore for TableCursorStore {
    async fn get(&self, name: &str) -> Result<Option<CursorRecord>> {
        Ok(self.get_versioned(name).await?.map(|v| v.record))
    }

    async fn set(&self, name: &str, value: DateTime<Utc>) -> Result<CursorRecord> {
        if name.is_empty() {
            return Err(ScanError::InvalidRequest(
                "cursor name must not be empty".into(),
            ));
        }
        let record = CursorRecord {
            name: name.to_string(),
            value,
            updated_at: Utc::now(),
        };
        let body = serde_json::to_value(&record)?;
        match self.get_versioned(name).await? {
            Some(existing) => {
                self.store
                    .replace(CURSOR_TABLE, CURSOR_PARTITION, name, body, &existing.etag)
                    .await?;
                info!(
                    cursor = %name,
                    from = %existing.record.value,
                    to = %value,
                    "cursor moved"
                );
            }
            None => {
                self.store
                    .insert(CURSOR_TABLE, CURSOR_PARTITION, name, body)
                    .await?;
                info!(cursor = %name, to = %value, "cursor created");
            }
        }
        Ok(record)
    }

    async fn list(&self) -> Result<Vec<CursorRecord>> {
        let rows = query_all(
            self.store.as_ref(),
            CURSOR_TABLE,
            CURSOR_PARTITION,
            &RowRange::all(),
            1_000,
        )
        .await?;
        rows.iter().map(|row| row.decode()).collect()
    }
}
