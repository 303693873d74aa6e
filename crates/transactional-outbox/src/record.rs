//! The outbox record: the durable unit of work the engine delivers exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle state of a record. See the engine's record state machine: `NEW -> COMPLETED`,
/// `NEW -> NEW` (rescheduled retry), `NEW -> FAILED`. Terminal states are `Completed` and
/// `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    New,
    Completed,
    Failed,
}

impl RecordStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RecordStatus::Completed | RecordStatus::Failed)
    }
}

/// A row in `outbox_record`: one delivery intent written atomically alongside business data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: String,
    pub key: String,
    pub partition: u16,
    pub handler_id: String,
    pub record_type: String,
    pub payload: Vec<u8>,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_count: i32,
    pub next_retry_at: DateTime<Utc>,
    pub failure_exception: Option<String>,
    pub context: BTreeMap<String, String>,
}

impl OutboxRecord {
    /// Build a brand-new, unpersisted record for `schedule()`. `partition` must already be
    /// `hash(key) mod 256` — computed once by the caller so both this constructor and the
    /// partition coordinator agree on the same frozen formula.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        key: String,
        partition: u16,
        handler_id: String,
        record_type: String,
        payload: Vec<u8>,
        created_at: DateTime<Utc>,
        context: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id,
            key,
            partition,
            handler_id,
            record_type,
            payload,
            status: RecordStatus::New,
            created_at,
            completed_at: None,
            failure_count: 0,
            next_retry_at: created_at,
            failure_exception: None,
            context,
        }
    }

    /// True when the record is eligible for an attempt right now.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == RecordStatus::New && self.next_retry_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_starts_new_with_zero_failures() {
        let now = Utc::now();
        let record = OutboxRecord::new(
            "id-1".into(),
            "key-1".into(),
            7,
            "handler-a".into(),
            "order.created".into(),
            b"{}".to_vec(),
            now,
            BTreeMap::new(),
        );
        assert_eq!(record.status, RecordStatus::New);
        assert_eq!(record.failure_count, 0);
        assert_eq!(record.next_retry_at, now);
        assert!(record.is_eligible(now));
        assert!(!record.is_eligible(now - chrono::Duration::seconds(1)));
    }

    #[test]
    fn ineligible_once_not_new() {
        let now = Utc::now();
        let mut record = OutboxRecord::new(
            "id-2".into(),
            "key-2".into(),
            3,
            "handler-a".into(),
            "order.created".into(),
            b"{}".to_vec(),
            now,
            BTreeMap::new(),
        );
        record.status = RecordStatus::Completed;
        assert!(!record.is_eligible(now));
    }
}
