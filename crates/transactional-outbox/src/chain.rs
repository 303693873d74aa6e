//! Processor chain: Primary -> Retry -> Fallback, evaluated once per record (§4.4).

use crate::clock::Clock;
use crate::error::OutboxResult;
use crate::fallback::{FallbackInvoker, FallbackOutcome};
use crate::invoker::HandlerInvoker;
use crate::record::OutboxRecord;
use crate::retry::RetryPolicyRegistry;
use crate::store::RecordStore;
use std::sync::Arc;
use tracing::{info, instrument};

/// Result of running the chain on one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOutcome {
    /// Primary or fallback succeeded; the record is complete.
    Completed,
    /// Retry stage rescheduled the record; the key's head-of-line now blocks here.
    Rescheduled,
    /// Fallback was missing or itself failed; the record ends FAILED.
    Failed,
}

/// Chain-of-responsibility: handler invocation, retry scheduling, and fallback, wired to the
/// stores and config knobs that decide completion/deletion policy.
pub struct ProcessorChain {
    record_store: Arc<dyn RecordStore>,
    invoker: Arc<HandlerInvoker>,
    retry_policies: Arc<RetryPolicyRegistry>,
    fallback_invoker: Arc<FallbackInvoker>,
    clock: Arc<dyn Clock>,
    delete_completed_records: bool,
}

impl ProcessorChain {
    pub fn new(
        record_store: Arc<dyn RecordStore>,
        invoker: Arc<HandlerInvoker>,
        retry_policies: Arc<RetryPolicyRegistry>,
        fallback_invoker: Arc<FallbackInvoker>,
        clock: Arc<dyn Clock>,
        delete_completed_records: bool,
    ) -> Self {
        Self {
            record_store,
            invoker,
            retry_policies,
            fallback_invoker,
            clock,
            delete_completed_records,
        }
    }

    #[instrument(skip(self, record), fields(record_id = %record.id, key = %record.key))]
    pub async fn process(&self, record: &OutboxRecord) -> OutboxResult<ChainOutcome> {
        match self.invoker.invoke(record).await {
            Ok(()) => {
                self.complete(record).await?;
                Ok(ChainOutcome::Completed)
            }
            Err(error) => self.retry_or_fallback(record, error).await,
        }
    }

    async fn complete(&self, record: &OutboxRecord) -> OutboxResult<()> {
        let now = self.clock.now();
        self.record_store.mark_completed(&record.id, now, self.delete_completed_records).await?;
        info!(record_id = %record.id, key = %record.key, "record completed");
        Ok(())
    }

    async fn retry_or_fallback(&self, record: &OutboxRecord, error: crate::error::OutboxError) -> OutboxResult<ChainOutcome> {
        let policy = self.retry_policies.policy_for(&record.handler_id);
        let failure_count = record.failure_count + 1;
        let failure_message = error.to_string();

        if failure_count < policy.max_attempts() && policy.should_retry(&error) {
            let next_retry_at = self.clock.now() + policy.next_delay(failure_count);
            self.record_store
                .mark_retry(&record.id, failure_count, next_retry_at, &failure_message)
                .await?;
            info!(record_id = %record.id, key = %record.key, failure_count, "record rescheduled for retry");
            return Ok(ChainOutcome::Rescheduled);
        }

        let mut failed_record = record.clone();
        failed_record.failure_count = failure_count;
        let failure_context = FallbackInvoker::build_failure_context(&failed_record, &failure_message, &policy, &error);

        match self.fallback_invoker.invoke(&failed_record, failure_context).await {
            FallbackOutcome::Succeeded => {
                self.complete(record).await?;
                Ok(ChainOutcome::Completed)
            }
            FallbackOutcome::Failed(fallback_error) => {
                self.record_store.mark_failed(&record.id, &fallback_error).await?;
                info!(record_id = %record.id, key = %record.key, "record failed: fallback raised");
                Ok(ChainOutcome::Failed)
            }
            FallbackOutcome::NotRegistered => {
                self.record_store.mark_failed(&record.id, &failure_message).await?;
                info!(record_id = %record.id, key = %record.key, "record failed: no fallback registered");
                Ok(ChainOutcome::Failed)
            }
        }
    }
}
