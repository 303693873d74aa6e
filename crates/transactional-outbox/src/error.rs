//! Error taxonomy for the transactional outbox engine.

use thiserror::Error;

/// Result type alias for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Errors that can occur while scheduling, routing, or processing outbox records.
///
/// Every variant maps to exactly one of the error kinds named in the engine's design: most are
/// captured on the record (never propagated out of the scheduler loop), a few are fatal at
/// startup or at `schedule()` call time.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Invalid or missing configuration; fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// `schedule()` could not resolve a handler-id from the payload/record type.
    #[error("no matching handler for record type {0:?}")]
    NoMatchingHandler(Option<String>),

    /// A record references a handler-id that is not registered. Fatal for that record: it is
    /// marked FAILED without ever invoking a handler.
    #[error("unknown handler id: {0}")]
    UnknownHandler(String),

    /// Payload (de)serialization failed. The record is marked FAILED.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The handler itself returned an error. Flows into the retry chain.
    #[error("handler failure: {0}")]
    HandlerFailure(String),

    /// The retry policy decided this error is not retryable; go straight to fallback.
    #[error("non-retryable error: {0}")]
    NonRetryable(String),

    /// The fallback handler itself failed. The record is marked FAILED.
    #[error("fallback failure: {0}")]
    FallbackFailure(String),

    /// A compare-and-swap on a partition assignment lost the race. Retried on the coordinator's
    /// next signal, never surfaced to the caller as fatal.
    #[error("concurrency conflict on partition {0}")]
    ConcurrencyConflict(u16),

    /// A store operation failed in a way expected to be transient (connection reset, timeout).
    /// Retried a bounded number of times within the current tick.
    #[error("transient store error: {0}")]
    TransientStoreError(String),

    /// Record not found when a by-id operation expected one to exist.
    #[error("record not found: {0}")]
    RecordNotFound(String),

    /// Instance not found when a by-id operation expected one to exist.
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// Catch-all for context-carrying errors that don't map to a more specific kind.
    #[error("outbox error: {0}")]
    Other(#[from] anyhow::Error),
}

impl OutboxError {
    /// True for the subset of errors worth another attempt within the same tick (bounded store
    /// retry, not the handler-level retry policy).
    pub fn is_transient_store_error(&self) -> bool {
        matches!(
            self,
            OutboxError::Database(_) | OutboxError::TransientStoreError(_)
        )
    }
}
