//! Processing scheduler: drives the processor chain for records this instance owns, at the rate
//! set by the poll trigger, with per-key ordering and bounded fan-out (§4.7).

use crate::chain::{ChainOutcome, ProcessorChain};
use crate::clock::Clock;
use crate::coordinator::PartitionCoordinator;
use crate::error::OutboxResult;
use crate::record::RecordStatus;
use crate::store::RecordStore;
use crate::store_retry::with_store_retry;
use crate::trigger::PollTrigger;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Drives one polling loop per engine instance.
pub struct ProcessingScheduler {
    record_store: Arc<dyn RecordStore>,
    coordinator: Arc<PartitionCoordinator>,
    chain: Arc<ProcessorChain>,
    clock: Arc<dyn Clock>,
    trigger: PollTrigger,
    batch_size: i64,
    stop_on_key_failure: bool,
    ignore_record_keys_with_previous_failure: bool,
    semaphore: Arc<Semaphore>,
}

impl ProcessingScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        record_store: Arc<dyn RecordStore>,
        coordinator: Arc<PartitionCoordinator>,
        chain: Arc<ProcessorChain>,
        clock: Arc<dyn Clock>,
        trigger: PollTrigger,
        batch_size: i64,
        stop_on_key_failure: bool,
        ignore_record_keys_with_previous_failure: bool,
        worker_limit: usize,
    ) -> Self {
        Self {
            record_store,
            coordinator,
            chain,
            clock,
            trigger,
            batch_size,
            stop_on_key_failure,
            ignore_record_keys_with_previous_failure,
            semaphore: Arc::new(Semaphore::new(worker_limit)),
        }
    }

    /// Run the poll loop until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let processed = match self.tick().await {
                Ok(count) => count,
                Err(error) => {
                    warn!(error = %error, "scheduler tick failed, will retry next tick");
                    0
                }
            };

            let delay = self.trigger.on_tick_complete(processed);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        info!("scheduler loop exited");
    }

    /// One tick: pick eligible keys in owned partitions, fan out bounded by `worker_limit`, and
    /// return the total number of records processed across all keys.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> OutboxResult<i64> {
        let owned = self.coordinator.owned();
        if owned.is_empty() {
            return Ok(0);
        }
        let partitions: Vec<u16> = owned.iter().copied().collect();
        let now = self.clock.now();

        let keys = with_store_retry(|| {
            self.record_store
                .list_eligible_keys(&partitions, self.batch_size, now, self.ignore_record_keys_with_previous_failure)
        })
        .await?;

        if keys.is_empty() {
            return Ok(0);
        }

        let mut tasks = Vec::with_capacity(keys.len());
        for key in keys {
            let permit = self.semaphore.clone().acquire_owned().await.expect("semaphore never closed");
            let record_store = self.record_store.clone();
            let chain = self.chain.clone();
            let clock = self.clock.clone();
            let stop_on_key_failure = self.stop_on_key_failure;

            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                process_key(record_store, chain, clock, &key, stop_on_key_failure).await
            }));
        }

        let mut total = 0i64;
        for task in tasks {
            match task.await {
                Ok(Ok(count)) => total += count,
                Ok(Err(error)) => warn!(error = %error, "key processing task failed"),
                Err(join_error) => warn!(error = %join_error, "key processing task panicked"),
            }
        }

        Ok(total)
    }
}

/// Process every eligible record for one key, in creation order, honoring head-of-line blocking:
/// stop at the first record that is a NEW-but-not-yet-due retry, was rescheduled this tick, or
/// (when configured) failed terminally. A terminally FAILED record blocks the key only when
/// `stop_on_key_failure` is set; otherwise it is skipped so later records on the same key still
/// get a chance, including on a later tick (`load_incomplete_for_key` keeps returning it until
/// `stop_on_key_failure` is toggled or the row is otherwise cleaned up).
async fn process_key(
    record_store: Arc<dyn RecordStore>,
    chain: Arc<ProcessorChain>,
    clock: Arc<dyn Clock>,
    key: &str,
    stop_on_key_failure: bool,
) -> OutboxResult<i64> {
    let records = record_store.load_incomplete_for_key(key).await?;
    let now = clock.now();
    let mut processed = 0i64;

    for record in records {
        if record.status == RecordStatus::Failed {
            if stop_on_key_failure {
                break;
            }
            continue;
        }

        if !record.is_eligible(now) {
            break;
        }

        match chain.process(&record).await? {
            ChainOutcome::Completed => {
                processed += 1;
            }
            ChainOutcome::Rescheduled => break,
            ChainOutcome::Failed => {
                processed += 1;
                if stop_on_key_failure {
                    break;
                }
            }
        }
    }

    Ok(processed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::fallback::FallbackInvoker;
    use crate::handler::{Handler, HandlerKind, HandlerRegistryBuilder, Metadata};
    use crate::instance::OutboxInstance;
    use crate::instance_registry::InstanceRegistry;
    use crate::invoker::HandlerInvoker;
    use crate::partition::PartitionAssignment;
    use crate::record::OutboxRecord;
    use crate::retry::RetryPolicyRegistry;
    use crate::store::{InstanceStore, PartitionStore};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use sqlx::{Postgres, Transaction};
    use std::collections::BTreeMap;
    use std::time::Duration as StdDuration;

    struct AlwaysOk;
    #[async_trait]
    impl Handler for AlwaysOk {
        async fn handle(&self, _payload: &[u8], _metadata: &Metadata) -> OutboxResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeRecordStore {
        records: Mutex<Vec<OutboxRecord>>,
    }

    #[async_trait]
    impl RecordStore for FakeRecordStore {
        async fn insert(&self, _tx: &mut Transaction<'_, Postgres>, record: &OutboxRecord) -> OutboxResult<()> {
            self.records.lock().push(record.clone());
            Ok(())
        }
        async fn list_eligible_keys(&self, partitions: &[u16], _limit: i64, now: DateTime<Utc>, _ignore: bool) -> OutboxResult<Vec<String>> {
            let records = self.records.lock();
            let mut keys: Vec<String> = records
                .iter()
                .filter(|r| partitions.contains(&r.partition) && r.is_eligible(now))
                .map(|r| r.key.clone())
                .collect();
            keys.sort();
            keys.dedup();
            Ok(keys)
        }
        async fn load_incomplete_for_key(&self, key: &str) -> OutboxResult<Vec<OutboxRecord>> {
            let mut records: Vec<OutboxRecord> = self
                .records
                .lock()
                .iter()
                .filter(|r| r.key == key && r.completed_at.is_none())
                .cloned()
                .collect();
            records.sort_by_key(|r| r.created_at);
            Ok(records)
        }
        async fn mark_completed(&self, id: &str, now: DateTime<Utc>, delete: bool) -> OutboxResult<()> {
            let mut records = self.records.lock();
            if delete {
                records.retain(|r| r.id != id);
            } else if let Some(record) = records.iter_mut().find(|r| r.id == id) {
                record.status = crate::record::RecordStatus::Completed;
                record.completed_at = Some(now);
            }
            Ok(())
        }
        async fn mark_retry(&self, id: &str, failure_count: i32, next_retry_at: DateTime<Utc>, failure_exception: &str) -> OutboxResult<()> {
            if let Some(record) = self.records.lock().iter_mut().find(|r| r.id == id) {
                record.failure_count = failure_count;
                record.next_retry_at = next_retry_at;
                record.failure_exception = Some(failure_exception.to_string());
            }
            Ok(())
        }
        async fn mark_failed(&self, id: &str, failure_exception: &str) -> OutboxResult<()> {
            if let Some(record) = self.records.lock().iter_mut().find(|r| r.id == id) {
                record.status = crate::record::RecordStatus::Failed;
                record.failure_exception = Some(failure_exception.to_string());
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct SoloInstanceStore {
        instances: Mutex<Vec<OutboxInstance>>,
    }

    #[async_trait]
    impl InstanceStore for SoloInstanceStore {
        async fn register(&self, instance: &OutboxInstance) -> OutboxResult<()> {
            self.instances.lock().push(instance.clone());
            Ok(())
        }
        async fn heartbeat(&self, _instance_id: &str, _now: DateTime<Utc>) -> OutboxResult<u64> {
            Ok(1)
        }
        async fn list_active(&self) -> OutboxResult<Vec<OutboxInstance>> {
            Ok(self.instances.lock().clone())
        }
        async fn mark_shutting_down(&self, _instance_id: &str, _now: DateTime<Utc>) -> OutboxResult<()> {
            Ok(())
        }
        async fn delete(&self, _instance_id: &str) -> OutboxResult<()> {
            Ok(())
        }
        async fn list_stale(&self, _now: DateTime<Utc>, _stale_timeout: chrono::Duration) -> OutboxResult<Vec<OutboxInstance>> {
            Ok(vec![])
        }
    }

    struct AllMinePartitionStore {
        self_id: Mutex<Option<String>>,
    }

    #[async_trait]
    impl PartitionStore for AllMinePartitionStore {
        async fn ensure_bootstrapped(&self, _now: DateTime<Utc>) -> OutboxResult<()> {
            Ok(())
        }
        async fn list_all(&self) -> OutboxResult<Vec<PartitionAssignment>> {
            let self_id = self.self_id.lock().clone().unwrap_or_default();
            Ok((0..crate::hash::PARTITION_COUNT)
                .map(|p| {
                    let mut a = PartitionAssignment::unassigned(p, Utc::now());
                    a.instance_id = Some(self_id.clone());
                    a
                })
                .collect())
        }
        async fn cas_claim(&self, _partition_number: u16, _expected_version: i64, _instance_id: &str, _now: DateTime<Utc>) -> OutboxResult<bool> {
            Ok(true)
        }
        async fn cas_release(&self, _partition_number: u16, _expected_version: i64, _now: DateTime<Utc>) -> OutboxResult<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn tick_processes_eligible_key_end_to_end() {
        let clock = Arc::new(TestClock::new(Utc::now()));
        let record_store = Arc::new(FakeRecordStore::default());
        let record = OutboxRecord::new(
            "rec-1".into(),
            "key-1".into(),
            0,
            "h1".into(),
            "Kind".into(),
            vec![],
            clock.now(),
            BTreeMap::new(),
        );
        record_store.records.lock().push(record);

        let registry = Arc::new(
            HandlerRegistryBuilder::new()
                .register_handler("h1", HandlerKind::Typed { record_type: "Kind".into(), handler: Arc::new(AlwaysOk) })
                .build(),
        );
        let invoker = Arc::new(HandlerInvoker::new(registry.clone(), vec![]));
        let retry_policies = Arc::new(RetryPolicyRegistry::default());
        let fallback_invoker = Arc::new(FallbackInvoker::new(registry));
        let chain = Arc::new(ProcessorChain::new(
            record_store.clone(),
            invoker,
            retry_policies,
            fallback_invoker,
            clock.clone(),
            true,
        ));

        let instance_store = Arc::new(SoloInstanceStore::default());
        let instances = Arc::new(InstanceRegistry::new(
            instance_store,
            clock.clone(),
            "localhost".into(),
            0,
            chrono::Duration::seconds(30),
            StdDuration::from_millis(0),
        ));
        instances.register().await.unwrap();

        let partition_store = Arc::new(AllMinePartitionStore {
            self_id: Mutex::new(Some(instances.instance_id().to_string())),
        });
        let coordinator = Arc::new(PartitionCoordinator::new(partition_store, instances, clock.clone()));
        coordinator.rebalance().await.unwrap();
        assert_eq!(coordinator.owned().len(), crate::hash::PARTITION_COUNT as usize);

        let scheduler = ProcessingScheduler::new(
            record_store.clone(),
            coordinator,
            chain,
            clock,
            PollTrigger::fixed(StdDuration::from_millis(10)),
            100,
            true,
            false,
            4,
        );

        let processed = scheduler.tick().await.unwrap();
        assert_eq!(processed, 1);
        assert!(record_store.records.lock().is_empty());
    }

    #[tokio::test]
    async fn tick_with_no_owned_partitions_processes_nothing() {
        let clock = Arc::new(TestClock::new(Utc::now()));
        let record_store = Arc::new(FakeRecordStore::default());
        let registry = Arc::new(HandlerRegistryBuilder::new().build());
        let invoker = Arc::new(HandlerInvoker::new(registry.clone(), vec![]));
        let retry_policies = Arc::new(RetryPolicyRegistry::default());
        let fallback_invoker = Arc::new(FallbackInvoker::new(registry));
        let chain = Arc::new(ProcessorChain::new(
            record_store.clone(),
            invoker,
            retry_policies,
            fallback_invoker,
            clock.clone(),
            true,
        ));

        let instance_store = Arc::new(SoloInstanceStore::default());
        let instances = Arc::new(InstanceRegistry::new(
            instance_store,
            clock.clone(),
            "localhost".into(),
            0,
            chrono::Duration::seconds(30),
            StdDuration::from_millis(0),
        ));
        let partition_store = Arc::new(AllMinePartitionStore { self_id: Mutex::new(None) });
        let coordinator = Arc::new(PartitionCoordinator::new(partition_store, instances, clock.clone()));

        let scheduler = ProcessingScheduler::new(
            record_store,
            coordinator,
            chain,
            clock,
            PollTrigger::fixed(StdDuration::from_millis(10)),
            100,
            true,
            false,
            4,
        );

        assert_eq!(scheduler.tick().await.unwrap(), 0);
    }

    /// A FAILED record left at the head of the key's incomplete set (as `mark_failed` leaves it,
    /// `completed_at` still `NULL`) must not block a later, still-NEW sibling on the same key when
    /// `stop_on_key_failure` is false — and this must hold across separate `process_key` calls
    /// (i.e. separate ticks), not just within the tick where the failure happened.
    #[tokio::test]
    async fn stop_on_key_failure_false_skips_past_failed_head_across_ticks() {
        let clock = Arc::new(TestClock::new(Utc::now()));
        let record_store = Arc::new(FakeRecordStore::default());

        let mut failed = OutboxRecord::new(
            "rec-failed".into(),
            "key-1".into(),
            0,
            "h1".into(),
            "Kind".into(),
            vec![],
            clock.now() - chrono::Duration::seconds(10),
            BTreeMap::new(),
        );
        failed.status = crate::record::RecordStatus::Failed;
        failed.failure_exception = Some("exhausted retries".into());
        record_store.records.lock().push(failed);

        // Simulates a tick where the FAILED head was already present and nothing else was due yet.
        let registry = Arc::new(HandlerRegistryBuilder::new().build());
        let invoker = Arc::new(HandlerInvoker::new(registry.clone(), vec![]));
        let retry_policies = Arc::new(RetryPolicyRegistry::default());
        let fallback_invoker = Arc::new(FallbackInvoker::new(registry.clone()));
        let chain = Arc::new(ProcessorChain::new(
            record_store.clone(),
            invoker.clone(),
            retry_policies.clone(),
            fallback_invoker.clone(),
            clock.clone(),
            true,
        ));
        let processed = process_key(record_store.clone(), chain.clone(), clock.clone(), "key-1", false).await.unwrap();
        assert_eq!(processed, 0);

        // A second record on the same key is written afterward, on a later tick.
        let second = OutboxRecord::new("rec-second".into(), "key-1".into(), 0, "h1".into(), "Kind".into(), vec![], clock.now(), BTreeMap::new());
        record_store.records.lock().push(second);

        let registry = Arc::new(
            HandlerRegistryBuilder::new()
                .register_handler("h1", HandlerKind::Typed { record_type: "Kind".into(), handler: Arc::new(AlwaysOk) })
                .build(),
        );
        let invoker = Arc::new(HandlerInvoker::new(registry.clone(), vec![]));
        let fallback_invoker = Arc::new(FallbackInvoker::new(registry));
        let chain = Arc::new(ProcessorChain::new(record_store.clone(), invoker, retry_policies, fallback_invoker, clock.clone(), true));

        let processed = process_key(record_store.clone(), chain, clock, "key-1", false).await.unwrap();
        assert_eq!(processed, 1);

        let remaining = record_store.records.lock();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "rec-failed");
    }
}
