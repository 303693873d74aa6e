//! Partition assignment persistence: ownership CAS and bootstrap.

use crate::error::OutboxResult;
use crate::hash::PARTITION_COUNT;
use crate::partition::PartitionAssignment;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::debug;

/// Repository for `outbox_partition`.
#[async_trait]
pub trait PartitionStore: Send + Sync {
    /// Create-if-absent upsert of all 256 rows, `instance_id = NULL, version = 0`. Safe to call
    /// from every instance concurrently; conflicting inserts are no-ops.
    async fn ensure_bootstrapped(&self, now: DateTime<Utc>) -> OutboxResult<()>;

    /// Read all 256 rows.
    async fn list_all(&self) -> OutboxResult<Vec<PartitionAssignment>>;

    /// Attempt to claim `partition_number` for `instance_id`, conditioned on the row still being
    /// at `expected_version`. Returns `true` iff the CAS won.
    async fn cas_claim(
        &self,
        partition_number: u16,
        expected_version: i64,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> OutboxResult<bool>;

    /// Attempt to release `partition_number` back to unowned, conditioned on `expected_version`.
    /// Returns `true` iff the CAS won.
    async fn cas_release(&self, partition_number: u16, expected_version: i64, now: DateTime<Utc>) -> OutboxResult<bool>;
}

/// PostgreSQL implementation of [`PartitionStore`].
pub struct SqlxPartitionStore {
    pool: PgPool,
}

impl SqlxPartitionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn parse_row(row: &sqlx::postgres::PgRow) -> OutboxResult<PartitionAssignment> {
        Ok(PartitionAssignment {
            partition_number: row.try_get::<i32, _>("partition_number")? as u16,
            instance_id: row.try_get("instance_id")?,
            version: row.try_get("version")?,
            assigned_at: row.try_get("assigned_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub async fn init_schema(&self) -> OutboxResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_partition (
                partition_number INTEGER PRIMARY KEY,
                instance_id TEXT,
                version BIGINT NOT NULL DEFAULT 0,
                assigned_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_outbox_partition_instance
                ON outbox_partition (instance_id);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PartitionStore for SqlxPartitionStore {
    async fn ensure_bootstrapped(&self, now: DateTime<Utc>) -> OutboxResult<()> {
        let mut tx = self.pool.begin().await?;
        for partition_number in 0..PARTITION_COUNT {
            sqlx::query(
                r#"
                INSERT INTO outbox_partition (partition_number, instance_id, version, assigned_at, updated_at)
                VALUES ($1, NULL, 0, $2, $2)
                ON CONFLICT (partition_number) DO NOTHING
                "#,
            )
            .bind(partition_number as i32)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(count = PARTITION_COUNT, "partition table bootstrapped");
        Ok(())
    }

    async fn list_all(&self) -> OutboxResult<Vec<PartitionAssignment>> {
        let rows = sqlx::query(
            "SELECT partition_number, instance_id, version, assigned_at, updated_at FROM outbox_partition",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn cas_claim(
        &self,
        partition_number: u16,
        expected_version: i64,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> OutboxResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_partition
            SET instance_id = $3, version = version + 1, updated_at = $4
            WHERE partition_number = $1 AND version = $2
            "#,
        )
        .bind(partition_number as i32)
        .bind(expected_version)
        .bind(instance_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn cas_release(&self, partition_number: u16, expected_version: i64, now: DateTime<Utc>) -> OutboxResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_partition
            SET instance_id = NULL, version = version + 1, updated_at = $3
            WHERE partition_number = $1 AND version = $2
            "#,
        )
        .bind(partition_number as i32)
        .bind(expected_version)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
