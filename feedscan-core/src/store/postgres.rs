//! Postgres-backed table store. Every logical table shares
//! `feed_table_rows`; keys use the "C" collation so row-key ranges order
//! bytewise, like the in-memory store.

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use super::{
    BatchOperation, RowPage, RowRange, TableRow, TableStore, validate_batch,
};
use crate::error::{Result, ScanError};

#[derive(Clone)]
pub struct PostgresTableStore {
    pool: PgPool,
    max_batch_size: usize,
}

impl fmt::Debug for PostgresTableStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresTableStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .field("max_batch_size", &self.max_batch_size)
            .finish()
    }
}

impl PostgresTableStore {
    /// Connect and verify the database answers.
    pub async fn new(pool: PgPool, max_batch_size: usize) -> Result<Self> {
        sqlx::query("SELECT 1").execute(&pool).await.map_err(|e| {
            ScanError::Internal(format!(
                "table store failed Postgres health check: {e}"
            ))
        })?;
        info!("Table store connected to Postgres");
        Ok(Self {
            pool,
            max_batch_size,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_in(
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        partition_key: &str,
        row_key: &str,
        value: &Value,
    ) -> Result<String> {
        let etag = Uuid::new_v4();
        let inserted = sqlx::query(
            r#"
            INSERT INTO feed_table_rows (table_name, partition_key, row_key, etag, value)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (table_name, partition_key, row_key) DO NOTHING
            "#,
        )
        .bind(table)
        .bind(partition_key)
        .bind(row_key)
        .bind(etag)
        .bind(Json(value))
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(ScanError::AlreadyExists {
                table: table.to_string(),
                partition_key: partition_key.to_string(),
                row_key: row_key.to_string(),
            });
        }
        Ok(etag.to_string())
    }

    async fn replace_in(
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        partition_key: &str,
        row_key: &str,
        value: &Value,
        etag: &str,
    ) -> Result<String> {
        let conflict = || ScanError::VersionConflict {
            table: table.to_string(),
            partition_key: partition_key.to_string(),
            row_key: row_key.to_string(),
        };
        let expected = Uuid::parse_str(etag).map_err(|_| conflict())?;
        let next = Uuid::new_v4();
        let updated = sqlx::query(
            r#"
            UPDATE feed_table_rows
            SET value = $5, etag = $6, updated_at = NOW()
            WHERE table_name = $1 AND partition_key = $2 AND row_key = $3 AND etag = $4
            "#,
        )
        .bind(table)
        .bind(partition_key)
        .bind(row_key)
        .bind(expected)
        .bind(Json(value))
        .bind(next)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(conflict());
        }
        Ok(next.to_string())
    }

    async fn delete_in(
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        partition_key: &str,
        row_key: &str,
        etag: Option<&str>,
    ) -> Result<bool> {
        let current: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT etag FROM feed_table_rows
            WHERE table_name = $1 AND partition_key = $2 AND row_key = $3
            FOR UPDATE
            "#,
        )
        .bind(table)
        .bind(partition_key)
        .bind(row_key)
        .fetch_optional(&mut **tx)
        .await?;

        let Some(current) = current else {
            return Ok(false);
        };
        if let Some(expected) = etag
            && current.to_string() != expected
        {
            return Err(ScanError::VersionConflict {
                table: table.to_string(),
                partition_key: partition_key.to_string(),
                row_key: row_key.to_string(),
            });
        }

        sqlx::query(
            r#"
            DELETE FROM feed_table_rows
            WHERE table_name = $1 AND partition_key = $2 AND row_key = $3
            "#,
        )
        .bind(table)
        .bind(partition_key)
        .bind(row_key)
        .execute(&mut **tx)
        .await?;
        Ok(true)
    }
}

fn decode_row(partition_key: &str, row: &sqlx::postgres::PgRow) -> Result<TableRow> {
    let row_key: String = row.try_get("row_key")?;
    let etag: Uuid = row.try_get("etag")?;
    let Json(value): Json<Value> = row.try_get("value")?;
    Ok(TableRow {
        partition_key: partition_key.to_string(),
        row_key,
        etag: etag.to_string(),
        value,
    })
}

#[async_trait]
impl TableStore for PostgresTableStore {
    async fn initialize(&self) -> Result<()> {
        crate::MIGRATOR.run(&self.pool).await.map_err(|e| {
            ScanError::Internal(format!("Migration failed: {e}"))
        })
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
        let row = sqlx::query(
            r#"
            SELECT row_key, etag, value FROM feed_table_rows
            WHERE table_name = $1 AND partition_key = $2 AND row_key = $3
            "#,
        )
        .bind(table)
        .bind(partition_key)
        .bind(row_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| decode_row(partition_key, &row)).transpose()
    }

    async fn insert(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        value: Value,
    ) -> Result<String> {
        let mut tx = self.pool.begin().await?;
        let etag =
            Self::insert_in(&mut tx, table, partition_key, row_key, &value)
                .await?;
        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;
        let next = Self::replace_in(
            &mut tx,
            table,
            partition_key,
            row_key,
            &value,
            etag,
        )
        .await?;
        tx.commit().await?;
        Ok(next)
    }

    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        etag: Option<&str>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let removed =
            Self::delete_in(&mut tx, table, partition_key, row_key, etag)
                .await?;
        tx.commit().await?;
        Ok(removed)
    }

    async fn query(
        &self,
        table: &str,
        partition_key: &str,
        range: &RowRange,
        limit: usize,
        continuation: Option<&str>,
    ) -> Result<RowPage> {
        let limit = limit.max(1);
        let rows = sqlx::query(
            r#"
            SELECT row_key, etag, value FROM feed_table_rows
            WHERE table_name = $1
              AND partition_key = $2
              AND ($3::text IS NULL OR row_key >= $3)
              AND ($4::text IS NULL OR row_key <= $4)
              AND ($5::text IS NULL OR row_key > $5)
            ORDER BY row_key
            LIMIT $6
            "#,
        )
        .bind(table)
        .bind(partition_key)
        .bind(range.start.as_deref())
        .bind(range.end.as_deref())
        .bind(continuation)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let rows = rows
            .iter()
            .map(|row| decode_row(partition_key, row))
            .collect::<Result<Vec<_>>>()?;
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
        if operations.is_empty() {
            return Ok(Vec::new());
        }

        // Any failing guard returns early and the dropped transaction rolls back.
        let mut tx = self.pool.begin().await?;
        let mut etags = Vec::with_capacity(operations.len());
        for op in &operations {
            match op {
                BatchOperation::Insert { row_key, value } => {
                    let etag = Self::insert_in(
                        &mut tx,
                        table,
                        partition_key,
                        row_key,
                        value,
                    )
                    .await?;
                    etags.push(Some(etag));
                }
                BatchOperation::Replace {
                    row_key,
                    value,
                    etag,
                } => {
                    let next = Self::replace_in(
                        &mut tx,
                        table,
                        partition_key,
                        row_key,
                        value,
                        etag,
                    )
                    .await?;
                    etags.push(Some(next));
                }
                BatchOperation::Delete { row_key, etag } => {
                    let removed = Self::delete_in(
                        &mut tx,
                        table,
                        partition_key,
                        row_key,
                        etag.as_deref(),
                    )
                    .await?;
                    if !removed {
                        return Err(ScanError::NotFound(format!(
                            "{table}/{partition_key}/{row_key}"
                        )));
                    }
                    etags.push(None);
                }
            }
        }
        tx.commit().await?;
        Ok(etags)
    }
}
