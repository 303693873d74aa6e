//! Convenience macros for scheduling records without spelling out [`crate::outbox::ScheduleOptions`]
//! at every call site.

/// Schedule a record within a transaction, keyed by an explicit grouping key.
///
/// # Usage
///
/// ```rust,no_run
/// use transactional_outbox::{schedule_record, Outbox};
/// use sqlx::PgPool;
///
/// # async fn example(pool: PgPool, outbox: Outbox) -> Result<(), Box<dyn std::error::Error>> {
/// let mut tx = pool.begin().await?;
///
/// sqlx::query("INSERT INTO users (id, username) VALUES ($1, $2)")
///     .bind("user-1")
///     .bind("alice")
///     .execute(&mut *tx)
///     .await?;
///
/// schedule_record!(&outbox, &mut tx, "user-1", "user", "user.created", b"{}".to_vec());
///
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
///
/// # Arguments
///
/// * `$outbox` - reference to the running [`crate::outbox::Outbox`]
/// * `$tx` - mutable reference to the enclosing `sqlx::Transaction`
/// * `$key` - grouping key governing per-key ordering
/// * `$handler_id` - stable handler-id the record will be dispatched to
/// * `$record_type` - logical payload type, opaque to the engine
/// * `$payload` - already-serialized payload bytes
#[macro_export]
macro_rules! schedule_record {
    ($outbox:expr, $tx:expr, $key:expr, $handler_id:expr, $record_type:expr, $payload:expr) => {{
        $outbox.schedule(
            $tx,
            $payload,
            $crate::ScheduleOptions {
                key: Some($key.to_string()),
                record_type: Some($record_type.to_string()),
                handler_id: Some($handler_id.to_string()),
                context: Default::default(),
            },
        )
    }};
}

/// Schedule a record with no grouping key (no ordering relative to any sibling record).
#[macro_export]
macro_rules! schedule_unkeyed_record {
    ($outbox:expr, $tx:expr, $handler_id:expr, $record_type:expr, $payload:expr) => {{
        $outbox.schedule(
            $tx,
            $payload,
            $crate::ScheduleOptions {
                key: None,
                record_type: Some($record_type.to_string()),
                handler_id: Some($handler_id.to_string()),
                context: Default::default(),
            },
        )
    }};
}

#[cfg(test)]
mod tests {
    // Macro tests are compile-time checks; if this file compiles, the macros expand correctly.
}
