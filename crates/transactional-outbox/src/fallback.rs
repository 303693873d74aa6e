//! Fallback invocation: the last stage of the processor chain for a record whose primary delivery
//! path has given up.

use crate::handler::{FailureContext, HandlerRegistry};
use crate::record::OutboxRecord;
use crate::retry::RetryPolicy;
use std::sync::Arc;
use tracing::{instrument, warn};

/// Invokes the fallback registered for a record's `handler_id`, if any.
pub struct FallbackInvoker {
    registry: Arc<HandlerRegistry>,
}

/// Outcome of attempting fallback for a record.
pub enum FallbackOutcome {
    /// No fallback was registered for this `handler_id`/`record_type`.
    NotRegistered,
    /// A fallback was invoked and it succeeded.
    Succeeded,
    /// A fallback was invoked and it failed; carries the error summary to store on the record.
    Failed(String),
}

impl FallbackInvoker {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    /// Build the [`FailureContext`] passed to a fallback, per §4.6.
    pub fn build_failure_context(record: &OutboxRecord, last_failure: &str, policy: &RetryPolicy, last_error: &crate::error::OutboxError) -> FailureContext {
        let retries_exhausted = record.failure_count >= policy.max_attempts();
        let non_retryable = !policy.should_retry(last_error);
        FailureContext {
            record_id: record.id.clone(),
            key: record.key.clone(),
            created_at: record.created_at,
            failure_count: record.failure_count,
            last_failure: last_failure.to_string(),
            handler_id: record.handler_id.clone(),
            retries_exhausted,
            non_retryable,
            context: record.context.clone(),
        }
    }

    /// Attempt fallback for `record`. Returns [`FallbackOutcome::NotRegistered`] iff no fallback
    /// matched, in which case the caller marks the record FAILED directly (§4.6).
    #[instrument(skip(self, record, failure_context), fields(record_id = %record.id, handler_id = %record.handler_id))]
    pub async fn invoke(&self, record: &OutboxRecord, failure_context: FailureContext) -> FallbackOutcome {
        let Some(fallback) = self.registry.resolve_fallback(record) else {
            return FallbackOutcome::NotRegistered;
        };

        match fallback.handle(&record.payload, &failure_context).await {
            Ok(()) => FallbackOutcome::Succeeded,
            Err(error) => {
                warn!(record_id = %record.id, error = %error, "fallback invocation failed");
                FallbackOutcome::Failed(error.to_string())
            }
        }
    }
}
