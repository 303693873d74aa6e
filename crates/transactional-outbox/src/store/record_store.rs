//! Record persistence: the table the application transaction writes to and the scheduler reads
//! from.

use crate::error::{OutboxError, OutboxResult};
use crate::record::{OutboxRecord, RecordStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::BTreeMap;
use tracing::debug;

fn status_code(status: RecordStatus) -> &'static str {
    match status {
        RecordStatus::New => "NEW",
        RecordStatus::Completed => "COMPLETED",
        RecordStatus::Failed => "FAILED",
    }
}

fn status_from_code(code: &str) -> RecordStatus {
    match code {
        "COMPLETED" => RecordStatus::Completed,
        "FAILED" => RecordStatus::Failed,
        _ => RecordStatus::New,
    }
}

/// Repository for `outbox_record`.
///
/// `insert` MUST be called within the caller's own transaction so the record commits atomically
/// with the business-logic write it accompanies; every other method runs its own short
/// transaction scoped to a single record or key, per the engine's concurrency model.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a new record within the caller's transaction.
    async fn insert(&self, tx: &mut Transaction<'_, Postgres>, record: &OutboxRecord) -> OutboxResult<()>;

    /// List up to `limit` distinct keys, restricted to `partitions`, that have at least one NEW
    /// record eligible at `now`. When `ignore_previous_failure` is set, a key is excluded if an
    /// earlier same-key record is incomplete and not NEW (a FAILED record blocking the head).
    async fn list_eligible_keys(
        &self,
        partitions: &[u16],
        limit: i64,
        now: DateTime<Utc>,
        ignore_previous_failure: bool,
    ) -> OutboxResult<Vec<String>>;

    /// Load every incomplete (`completed_at IS NULL`) record for `key`, oldest first.
    async fn load_incomplete_for_key(&self, key: &str) -> OutboxResult<Vec<OutboxRecord>>;

    /// Complete a record: either delete it or mark it COMPLETED with `completed_at = now`.
    async fn mark_completed(&self, id: &str, now: DateTime<Utc>, delete: bool) -> OutboxResult<()>;

    /// Reschedule a record for another attempt: bump `failure_count`, set `next_retry_at`, and
    /// record `failure_exception`. Status remains NEW.
    async fn mark_retry(
        &self,
        id: &str,
        failure_count: i32,
        next_retry_at: DateTime<Utc>,
        failure_exception: &str,
    ) -> OutboxResult<()>;

    /// Mark a record FAILED terminally: retries exhausted (or non-retryable) and either no
    /// fallback was registered or the fallback itself failed.
    async fn mark_failed(&self, id: &str, failure_exception: &str) -> OutboxResult<()>;
}

/// PostgreSQL implementation of [`RecordStore`].
pub struct SqlxRecordStore {
    pool: PgPool,
}

impl SqlxRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn parse_row(row: &sqlx::postgres::PgRow) -> OutboxResult<OutboxRecord> {
        let status_str: String = row.try_get("status")?;
        let context_json: serde_json::Value = row.try_get("context")?;
        let context: BTreeMap<String, String> = serde_json::from_value(context_json)?;

        Ok(OutboxRecord {
            id: row.try_get("id")?,
            key: row.try_get("key")?,
            partition: row.try_get::<i32, _>("partition")? as u16,
            handler_id: row.try_get("handler_id")?,
            record_type: row.try_get("record_type")?,
            payload: row.try_get("payload")?,
            status: status_from_code(&status_str),
            created_at: row.try_get("created_at")?,
            completed_at: row.try_get("completed_at")?,
            failure_count: row.try_get("failure_count")?,
            next_retry_at: row.try_get("next_retry_at")?,
            failure_exception: row.try_get("failure_exception")?,
            context,
        })
    }

    /// Create the `outbox_record` table and its required indexes if absent. Intended for tests
    /// and local bootstrap; production deployments should manage this via the host's own
    /// migration tooling.
    pub async fn init_schema(&self) -> OutboxResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_record (
                id TEXT PRIMARY KEY,
                key TEXT NOT NULL,
                partition INTEGER NOT NULL,
                handler_id TEXT NOT NULL,
                record_type TEXT NOT NULL,
                payload BYTEA NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ,
                failure_count INTEGER NOT NULL DEFAULT 0,
                next_retry_at TIMESTAMPTZ NOT NULL,
                failure_exception TEXT,
                context JSONB NOT NULL DEFAULT '{}'::jsonb
            );
            CREATE INDEX IF NOT EXISTS idx_outbox_record_partition_status_retry
                ON outbox_record (partition, status, next_retry_at);
            CREATE INDEX IF NOT EXISTS idx_outbox_record_status_retry
                ON outbox_record (status, next_retry_at);
            CREATE INDEX IF NOT EXISTS idx_outbox_record_key_created
                ON outbox_record (key, created_at);
            CREATE INDEX IF NOT EXISTS idx_outbox_record_key_completed_created
                ON outbox_record (key, completed_at, created_at);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Operational replay: reset every FAILED record created at or after `since` back to NEW so
    /// the scheduler redelivers it on the next tick. Returns the number of rows reset. Narrowly
    /// scoped to FAILED records — NEW/COMPLETED rows are left untouched, and a COMPLETED record
    /// already deleted by `delete_completed_records` cannot be replayed (by design: it already
    /// delivered successfully).
    pub async fn replay_since(&self, since: DateTime<Utc>) -> OutboxResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_record
            SET status = 'NEW', next_retry_at = now(), failure_count = 0, failure_exception = NULL
            WHERE status = 'FAILED' AND created_at >= $1
            "#,
        )
        .bind(since)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Operational replay over an explicit id range (inclusive), for re-driving a specific batch
    /// identified from an operator report rather than a time window.
    pub async fn replay_range(&self, from_id: &str, to_id: &str) -> OutboxResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_record
            SET status = 'NEW', next_retry_at = now(), failure_count = 0, failure_exception = NULL
            WHERE status = 'FAILED' AND id BETWEEN $1 AND $2
            "#,
        )
        .bind(from_id)
        .bind(to_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RecordStore for SqlxRecordStore {
    async fn insert(&self, tx: &mut Transaction<'_, Postgres>, record: &OutboxRecord) -> OutboxResult<()> {
        let context_json = serde_json::to_value(&record.context)?;
        sqlx::query(
            r#"
            INSERT INTO outbox_record (
                id, key, partition, handler_id, record_type, payload, status,
                created_at, completed_at, failure_count, next_retry_at, failure_exception, context
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(&record.id)
        .bind(&record.key)
        .bind(record.partition as i32)
        .bind(&record.handler_id)
        .bind(&record.record_type)
        .bind(&record.payload)
        .bind(status_code(record.status))
        .bind(record.created_at)
        .bind(record.completed_at)
        .bind(record.failure_count)
        .bind(record.next_retry_at)
        .bind(&record.failure_exception)
        .bind(context_json)
        .execute(&mut **tx)
        .await?;

        debug!(record_id = %record.id, key = %record.key, partition = record.partition, "record inserted");
        Ok(())
    }

    async fn list_eligible_keys(
        &self,
        partitions: &[u16],
        limit: i64,
        now: DateTime<Utc>,
        ignore_previous_failure: bool,
    ) -> OutboxResult<Vec<String>> {
        if partitions.is_empty() {
            return Ok(Vec::new());
        }
        let partitions: Vec<i32> = partitions.iter().map(|p| *p as i32).collect();

        let rows = sqlx::query(
            r#"
            SELECT DISTINCT r1.key AS key
            FROM outbox_record r1
            WHERE r1.partition = ANY($1)
              AND r1.status = 'NEW'
              AND r1.next_retry_at <= $2
              AND (
                  $3 = FALSE
                  OR NOT EXISTS (
                      SELECT 1 FROM outbox_record r2
                      WHERE r2.key = r1.key
                        AND r2.completed_at IS NULL
                        AND r2.status <> 'NEW'
                        AND r2.created_at < r1.created_at
                  )
              )
            LIMIT $4
            "#,
        )
        .bind(&partitions)
        .bind(now)
        .bind(ignore_previous_failure)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row.try_get::<String, _>("key").map_err(OutboxError::from))
            .collect()
    }

    async fn load_incomplete_for_key(&self, key: &str) -> OutboxResult<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, key, partition, handler_id, record_type, payload, status,
                   created_at, completed_at, failure_count, next_retry_at, failure_exception, context
            FROM outbox_record
            WHERE key = $1 AND completed_at IS NULL
            ORDER BY created_at ASC
            "#,
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::parse_row).collect()
    }

    async fn mark_completed(&self, id: &str, now: DateTime<Utc>, delete: bool) -> OutboxResult<()> {
        if delete {
            sqlx::query("DELETE FROM outbox_record WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query("UPDATE outbox_record SET status = 'COMPLETED', completed_at = $2 WHERE id = $1")
                .bind(id)
                .bind(now)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: &str,
        failure_count: i32,
        next_retry_at: DateTime<Utc>,
        failure_exception: &str,
    ) -> OutboxResult<()> {
        sqlx::query(
            r#"
            UPDATE outbox_record
            SET failure_count = $2, next_retry_at = $3, failure_exception = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(failure_count)
        .bind(next_retry_at)
        .bind(failure_exception)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: &str, failure_exception: &str) -> OutboxResult<()> {
        sqlx::query("UPDATE outbox_record SET status = 'FAILED', failure_exception = $2 WHERE id = $1")
            .bind(id)
            .bind(failure_exception)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
