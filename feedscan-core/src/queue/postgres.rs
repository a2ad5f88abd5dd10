use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{info, trace, warn};
use uuid::Uuid;

use super::{QueueName, QueueTransport, ReceivedMessage};
use crate::error::{Result, ScanError};

/// Durable queue backed by Postgres. Receives claim rows with
/// `FOR UPDATE SKIP LOCKED`, so any number of workers can poll the same
/// table without handing one message to two consumers at once.
#[derive(Clone)]
pub struct PostgresQueue {
    pool: PgPool,
    max_message_size: usize,
    max_dequeue_count: u32,
}

impl fmt::Debug for PostgresQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresQueue")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .field("max_message_size", &self.max_message_size)
            .field("max_dequeue_count", &self.max_dequeue_count)
            .finish()
    }
}

impl PostgresQueue {
    /// Create a queue and verify the database answers.
    pub async fn new(
        pool: PgPool,
        max_message_size: usize,
        max_dequeue_count: u32,
    ) -> Result<Self> {
        sqlx::query("SELECT 1").execute(&pool).await.map_err(|e| {
            ScanError::Internal(format!(
                "queue failed Postgres health check: {e}"
            ))
        })?;
        info!("Queue connected to Postgres");
        Ok(Self {
            pool,
            max_message_size,
            max_dequeue_count,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl QueueTransport for PostgresQueue {
    async fn initialize(&self) -> Result<()> {
        crate::MIGRATOR.run(&self.pool).await.map_err(|e| {
            ScanError::Internal(format!("Migration failed: {e}"))
        })
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    async fn send(
        &self,
        queue: QueueName,
        body: String,
        delay: Duration,
    ) -> Result<()> {
        if body.len() > self.max_message_size {
            return Err(ScanError::MessageTooLarge {
                size: body.len(),
                limit: self.max_message_size,
            });
        }
        sqlx::query(
            r#"
            INSERT INTO feed_queue_messages (id, queue_name, body, visible_at)
            VALUES ($1, $2, $3, NOW() + make_interval(secs => $4))
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(queue.as_str())
        .bind(body)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn receive(
        &self,
        queue: QueueName,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        let mut tx = self.pool.begin().await?;

        if queue == QueueName::Work {
            let poisoned = sqlx::query(
                r#"
                UPDATE feed_queue_messages
                SET queue_name = 'poison', visible_at = NOW(), dequeue_count = 0, receipt = NULL
                WHERE id IN (
                    SELECT id FROM feed_queue_messages
                    WHERE queue_name = 'work'
                      AND visible_at <= NOW()
                      AND dequeue_count >= $1
                    FOR UPDATE SKIP LOCKED
                )
                "#,
            )
            .bind(self.max_dequeue_count as i32)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if poisoned > 0 {
                warn!(
                    count = poisoned,
                    max_dequeue_count = self.max_dequeue_count,
                    "moving exhausted messages to poison queue"
                );
            }
        }

        let rows = sqlx::query(
            r#"
            WITH picked AS (
                SELECT id FROM feed_queue_messages
                WHERE queue_name = $1 AND visible_at <= NOW()
                ORDER BY visible_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE feed_queue_messages m
            SET dequeue_count = m.dequeue_count + 1,
                receipt = gen_random_uuid(),
                visible_at = NOW() + make_interval(secs => $3)
            FROM picked
            WHERE m.id = picked.id
            RETURNING m.id, m.body, m.dequeue_count, m.receipt
            "#,
        )
        .bind(queue.as_str())
        .bind(max.min(i64::MAX as usize) as i64)
        .bind(visibility_timeout.as_secs_f64())
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut received = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row.try_get("id")?;
            let receipt: Uuid = row.try_get("receipt")?;
            let dequeue_count: i32 = row.try_get("dequeue_count")?;
            received.push(ReceivedMessage {
                id: id.to_string(),
                receipt: receipt.to_string(),
                body: row.try_get("body")?,
                dequeue_count: dequeue_count.max(0) as u32,
            });
        }
        trace!(queue = %queue, count = received.len(), "received messages");
        Ok(received)
    }

    async fn complete(
        &self,
        queue: QueueName,
        message: &ReceivedMessage,
    ) -> Result<()> {
        let (Ok(id), Ok(receipt)) = (
            Uuid::parse_str(&message.id),
            Uuid::parse_str(&message.receipt),
        ) else {
            return Err(ScanError::InvalidRequest(format!(
                "malformed message handle {}",
                message.id
            )));
        };
        sqlx::query(
            r#"
            DELETE FROM feed_queue_messages
            WHERE id = $1 AND receipt = $2 AND queue_name = $3
            "#,
        )
        .bind(id)
        .bind(receipt)
        .bind(queue.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn approximate_count(&self, queue: QueueName) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM feed_queue_messages WHERE queue_name = $1",
        )
        .bind(queue.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as usize)
    }
}
