//! SQLite queue implementation for production persistence
//!
//! Envelopes live in the `command_queue` table until they are acked, so
//! anything published but not yet applied survives a restart. Each queue is
//! strictly FIFO: only the oldest unsettled envelope is ever eligible for
//! delivery, and a nacked envelope holds the head of its queue until its
//! retry is due.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use dicelog_domain::{CommandKind, EnvelopeId};

use crate::infrastructure::persistence::to_db_timestamp;
use crate::infrastructure::ports::{
    ClockPort, DeliveryTag, Envelope, QueueError, QueueItemStatus, QueueNotificationPort,
    QueuePort, WaitResult,
};

/// SQLite queue implementation
pub struct SqliteQueue<N: QueueNotificationPort> {
    pool: SqlitePool,
    kind: CommandKind,
    max_attempts: u32,
    notifier: N,
    clock: Arc<dyn ClockPort>,
}

impl<N: QueueNotificationPort> SqliteQueue<N> {
    pub async fn new(
        pool: SqlitePool,
        kind: CommandKind,
        max_attempts: u32,
        notifier: N,
        clock: Arc<dyn ClockPort>,
    ) -> Result<Self, QueueError> {
        // Ensure table exists
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS command_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                queue_name TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                scheduled_at TEXT,
                error_message TEXT
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| QueueError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_command_queue_status
            ON command_queue(queue_name, status, seq)
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| QueueError::Database(e.to_string()))?;

        Ok(Self {
            pool,
            kind,
            max_attempts,
            notifier,
            clock,
        })
    }

    /// Get the notifier for this queue
    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    fn queue_name(&self) -> &'static str {
        self.kind.queue_name()
    }

    fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, QueueError> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| QueueError::Backend(format!("Invalid datetime: {}", e)))
    }

    fn row_to_envelope(&self, row: &SqliteRow) -> Result<Envelope, QueueError> {
        let id_str: String = row.get("id");
        let id = Uuid::parse_str(&id_str)
            .map_err(|e| QueueError::Backend(format!("Invalid UUID: {}", e)))?;

        let status_str: String = row.get("status");
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");
        let scheduled_at: Option<String> = row.get("scheduled_at");
        let attempts: i64 = row.get("attempts");
        let max_attempts: i64 = row.get("max_attempts");

        Ok(Envelope {
            id: EnvelopeId::from_uuid(id),
            kind: self.kind,
            payload_json: row.get("payload_json"),
            status: QueueItemStatus::parse(&status_str)?,
            attempts: attempts as u32,
            max_attempts: max_attempts as u32,
            created_at: Self::parse_timestamp(&created_at)?,
            updated_at: Self::parse_timestamp(&updated_at)?,
            scheduled_at: scheduled_at
                .as_deref()
                .map(Self::parse_timestamp)
                .transpose()?,
            error_message: row.get("error_message"),
        })
    }

    /// Work out why settling `tag` touched no row.
    async fn settle_miss(&self, tag: &DeliveryTag) -> QueueError {
        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM command_queue WHERE id = ? AND queue_name = ?",
        )
        .bind(tag.envelope_id.to_string())
        .bind(self.queue_name())
        .fetch_one(&self.pool)
        .await;

        match exists {
            Ok(count) if count > 0 => QueueError::StaleDelivery {
                envelope_id: tag.envelope_id.to_string(),
                attempt: tag.attempt,
            },
            Ok(_) => QueueError::NotFound(tag.envelope_id.to_string()),
            Err(e) => QueueError::Database(e.to_string()),
        }
    }

    async fn count_with_status(&self, statuses: &str) -> Result<usize, QueueError> {
        let sql = format!(
            "SELECT COUNT(*) FROM command_queue WHERE queue_name = ? AND status IN ({})",
            statuses
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(self.queue_name())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QueueError::Database(e.to_string()))?;
        Ok(count as usize)
    }
}

#[async_trait]
impl<N: QueueNotificationPort + 'static> QueuePort for SqliteQueue<N> {
    fn kind(&self) -> CommandKind {
        self.kind
    }

    async fn publish(&self, payload_json: &str) -> Result<EnvelopeId, QueueError> {
        let id = EnvelopeId::new();
        let now_str = to_db_timestamp(self.clock.now());

        sqlx::query(
            r#"
            INSERT INTO command_queue
            (id, queue_name, payload_json, status, attempts, max_attempts, created_at, updated_at)
            VALUES (?, ?, ?, 'pending', 0, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(self.queue_name())
        .bind(payload_json)
        .bind(self.max_attempts as i64)
        .bind(&now_str)
        .bind(&now_str)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Database(e.to_string()))?;

        // Notify workers that work is available
        self.notifier.notify_work_available().await;

        Ok(id)
    }

    async fn receive(&self) -> Result<Option<Envelope>, QueueError> {
        let now_str = to_db_timestamp(self.clock.now());

        // Single statement: select-and-claim cannot race with another receiver.
        // Only the head of the queue is considered; if it is still processing
        // or its retry is not yet due, nothing is delivered.
        let row = sqlx::query(
            r#"
            UPDATE command_queue
            SET status = 'processing', updated_at = ?, attempts = attempts + 1
            WHERE seq = (
                SELECT seq FROM command_queue
                WHERE queue_name = ?
                AND status IN ('pending', 'delayed', 'processing')
                ORDER BY seq ASC
                LIMIT 1
            )
            AND (
                (status = 'pending')
                OR (status = 'delayed' AND scheduled_at <= ?)
            )
            RETURNING *
            "#,
        )
        .bind(&now_str)
        .bind(self.queue_name())
        .bind(&now_str)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QueueError::Database(e.to_string()))?;

        row.as_ref().map(|row| self.row_to_envelope(row)).transpose()
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            DELETE FROM command_queue
            WHERE id = ? AND queue_name = ? AND status = 'processing' AND attempts = ?
            "#,
        )
        .bind(tag.envelope_id.to_string())
        .bind(self.queue_name())
        .bind(tag.attempt as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(self.settle_miss(tag).await);
        }

        // The next envelope may already be waiting behind this one
        self.notifier.notify_work_available().await;
        Ok(())
    }

    async fn nack(
        &self,
        tag: &DeliveryTag,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE command_queue
            SET status = 'delayed', updated_at = ?, scheduled_at = ?, error_message = ?
            WHERE id = ? AND queue_name = ? AND status = 'processing' AND attempts = ?
            "#,
        )
        .bind(to_db_timestamp(self.clock.now()))
        .bind(to_db_timestamp(retry_at))
        .bind(error)
        .bind(tag.envelope_id.to_string())
        .bind(self.queue_name())
        .bind(tag.attempt as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(self.settle_miss(tag).await);
        }
        Ok(())
    }

    async fn dead_letter(&self, tag: &DeliveryTag, error: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE command_queue
            SET status = 'dead_letter', updated_at = ?, scheduled_at = NULL, error_message = ?
            WHERE id = ? AND queue_name = ? AND status = 'processing' AND attempts = ?
            "#,
        )
        .bind(to_db_timestamp(self.clock.now()))
        .bind(error)
        .bind(tag.envelope_id.to_string())
        .bind(self.queue_name())
        .bind(tag.attempt as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(self.settle_miss(tag).await);
        }

        self.notifier.notify_work_available().await;
        Ok(())
    }

    async fn release(&self, tag: &DeliveryTag) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE command_queue
            SET status = 'pending', updated_at = ?
            WHERE id = ? AND queue_name = ? AND status = 'processing' AND attempts = ?
            "#,
        )
        .bind(to_db_timestamp(self.clock.now()))
        .bind(tag.envelope_id.to_string())
        .bind(self.queue_name())
        .bind(tag.attempt as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(self.settle_miss(tag).await);
        }

        self.notifier.notify_work_available().await;
        Ok(())
    }

    async fn recover_unacked(&self) -> Result<usize, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE command_queue
            SET status = 'pending', updated_at = ?
            WHERE queue_name = ? AND status = 'processing'
            "#,
        )
        .bind(to_db_timestamp(self.clock.now()))
        .bind(self.queue_name())
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Database(e.to_string()))?;

        let recovered = result.rows_affected() as usize;
        if recovered > 0 {
            self.notifier.notify_work_available().await;
        }
        Ok(recovered)
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        self.count_with_status("'pending', 'delayed'").await
    }

    async fn dead_letter_count(&self) -> Result<usize, QueueError> {
        self.count_with_status("'dead_letter'").await
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<Envelope>, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM command_queue
            WHERE queue_name = ? AND status = 'dead_letter'
            ORDER BY seq ASC
            LIMIT ?
            "#,
        )
        .bind(self.queue_name())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueError::Database(e.to_string()))?;

        rows.iter().map(|row| self.row_to_envelope(row)).collect()
    }

    async fn requeue_dead_letters(&self) -> Result<usize, QueueError> {
        // Requeued envelopes keep their original position in the queue
        let result = sqlx::query(
            r#"
            UPDATE command_queue
            SET status = 'pending', attempts = 0, scheduled_at = NULL, updated_at = ?
            WHERE queue_name = ? AND status = 'dead_letter'
            "#,
        )
        .bind(to_db_timestamp(self.clock.now()))
        .bind(self.queue_name())
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Database(e.to_string()))?;

        let requeued = result.rows_affected() as usize;
        if requeued > 0 {
            self.notifier.notify_work_available().await;
        }
        Ok(requeued)
    }

    async fn wait_for_work(&self, timeout: Duration) -> WaitResult {
        self.notifier.wait_for_work(timeout).await
    }
}
