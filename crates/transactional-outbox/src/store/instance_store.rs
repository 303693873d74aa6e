//! Instance registration persistence: who is alive right now.

use crate::error::OutboxResult;
use crate::instance::{InstanceStatus, OutboxInstance};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::debug;

fn status_code(status: InstanceStatus) -> &'static str {
    match status {
        InstanceStatus::Active => "ACTIVE",
        InstanceStatus::ShuttingDown => "SHUTTING_DOWN",
        InstanceStatus::Dead => "DEAD",
    }
}

fn status_from_code(code: &str) -> InstanceStatus {
    match code {
        "SHUTTING_DOWN" => InstanceStatus::ShuttingDown,
        "DEAD" => InstanceStatus::Dead,
        _ => InstanceStatus::Active,
    }
}

/// Repository for `outbox_instance`.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Insert a fresh ACTIVE row for this instance.
    async fn register(&self, instance: &OutboxInstance) -> OutboxResult<()>;

    /// Update `last_heartbeat = now` for `instance_id`. Returns the number of rows affected (0
    /// means the row was deleted out from under us — e.g. by a peer's stale cleanup — and the
    /// caller should re-register).
    async fn heartbeat(&self, instance_id: &str, now: DateTime<Utc>) -> OutboxResult<u64>;

    /// All instances currently considered live (any status other than physically deleted rows,
    /// which don't exist in the table at all).
    async fn list_active(&self) -> OutboxResult<Vec<OutboxInstance>>;

    /// Set `status = SHUTTING_DOWN, updated_at = now`.
    async fn mark_shutting_down(&self, instance_id: &str, now: DateTime<Utc>) -> OutboxResult<()>;

    /// Delete the row outright. Idempotent: deleting an already-absent row is not an error.
    async fn delete(&self, instance_id: &str) -> OutboxResult<()>;

    /// Rows whose `last_heartbeat` is older than `now - stale_timeout`.
    async fn list_stale(&self, now: DateTime<Utc>, stale_timeout: chrono::Duration) -> OutboxResult<Vec<OutboxInstance>>;
}

/// PostgreSQL implementation of [`InstanceStore`].
pub struct SqlxInstanceStore {
    pool: PgPool,
}

impl SqlxInstanceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn parse_row(row: &sqlx::postgres::PgRow) -> OutboxResult<OutboxInstance> {
        let status_str: String = row.try_get("status")?;
        Ok(OutboxInstance {
            instance_id: row.try_get("instance_id")?,
            hostname: row.try_get("hostname")?,
            port: row.try_get::<i32, _>("port")? as u16,
            status: status_from_code(&status_str),
            started_at: row.try_get("started_at")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub async fn init_schema(&self) -> OutboxResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_instance (
                instance_id TEXT PRIMARY KEY,
                hostname TEXT NOT NULL,
                port INTEGER NOT NULL,
                status TEXT NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                last_heartbeat TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_outbox_instance_last_heartbeat
                ON outbox_instance (last_heartbeat);
            CREATE INDEX IF NOT EXISTS idx_outbox_instance_status_heartbeat
                ON outbox_instance (status, last_heartbeat);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for SqlxInstanceStore {
    async fn register(&self, instance: &OutboxInstance) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_instance (
                instance_id, hostname, port, status, started_at, last_heartbeat, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (instance_id) DO UPDATE SET
                status = EXCLUDED.status,
                last_heartbeat = EXCLUDED.last_heartbeat,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&instance.instance_id)
        .bind(&instance.hostname)
        .bind(instance.port as i32)
        .bind(status_code(instance.status))
        .bind(instance.started_at)
        .bind(instance.last_heartbeat)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await?;

        debug!(instance_id = %instance.instance_id, "instance registered");
        Ok(())
    }

    async fn heartbeat(&self, instance_id: &str, now: DateTime<Utc>) -> OutboxResult<u64> {
        let result = sqlx::query(
            "UPDATE outbox_instance SET last_heartbeat = $2, updated_at = $2 WHERE instance_id = $1",
        )
        .bind(instance_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_active(&self) -> OutboxResult<Vec<OutboxInstance>> {
        let rows = sqlx::query(
            r#"
            SELECT instance_id, hostname, port, status, started_at, last_heartbeat, created_at, updated_at
            FROM outbox_instance
            WHERE status <> 'SHUTTING_DOWN'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn mark_shutting_down(&self, instance_id: &str, now: DateTime<Utc>) -> OutboxResult<()> {
        sqlx::query("UPDATE outbox_instance SET status = 'SHUTTING_DOWN', updated_at = $2 WHERE instance_id = $1")
            .bind(instance_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, instance_id: &str) -> OutboxResult<()> {
        sqlx::query("DELETE FROM outbox_instance WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_stale(&self, now: DateTime<Utc>, stale_timeout: chrono::Duration) -> OutboxResult<Vec<OutboxInstance>> {
        let cutoff = now - stale_timeout;
        let rows = sqlx::query(
            r#"
            SELECT instance_id, hostname, port, status, started_at, last_heartbeat, created_at, updated_at
            FROM outbox_instance
            WHERE last_heartbeat < $1
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_row).collect()
    }
}
