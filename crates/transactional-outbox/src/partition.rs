//! Partition ownership: which instance, if any, currently owns each of the 256 partitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A row in `outbox_partition`. `version` is the CAS token: ownership transitions only by
/// `UPDATE ... WHERE partition_number = ? AND version = ?`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionAssignment {
    pub partition_number: u16,
    pub instance_id: Option<String>,
    pub version: i64,
    pub assigned_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PartitionAssignment {
    /// An unassigned row, as created during bootstrap's create-if-absent upsert.
    pub fn unassigned(partition_number: u16, now: DateTime<Utc>) -> Self {
        Self {
            partition_number,
            instance_id: None,
            version: 0,
            assigned_at: now,
            updated_at: now,
        }
    }

    /// Classification of this row relative to the caller's identity and the live instance set,
    /// used by the coordinator's rebalance algorithm.
    pub fn classify(&self, self_id: &str, live_instances: &std::collections::HashSet<String>) -> PartitionClass {
        match &self.instance_id {
            Some(owner) if owner == self_id => PartitionClass::Mine,
            Some(owner) if live_instances.contains(owner) => PartitionClass::ForeignAlive,
            _ => PartitionClass::Stale,
        }
    }
}

/// How a partition row relates to the current instance and the live membership set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionClass {
    /// Owned by this instance.
    Mine,
    /// Owned by another instance that is still alive.
    ForeignAlive,
    /// Owned by nobody, or by an instance no longer in the live set.
    Stale,
}
