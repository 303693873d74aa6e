//! A running worker process participating in the fleet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an [`OutboxInstance`]. `Dead` is never persisted — a dead instance is
/// recognized by a stale `last_heartbeat` and removed, not transitioned to a `Dead` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Active,
    ShuttingDown,
    Dead,
}

/// A row in `outbox_instance`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxInstance {
    pub instance_id: String,
    pub hostname: String,
    pub port: u16,
    pub status: InstanceStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxInstance {
    pub fn new(instance_id: String, hostname: String, port: u16, now: DateTime<Utc>) -> Self {
        Self {
            instance_id,
            hostname,
            port,
            status: InstanceStatus::Active,
            started_at: now,
            last_heartbeat: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, stale_timeout: chrono::Duration) -> bool {
        now - self.last_heartbeat > stale_timeout
    }
}
