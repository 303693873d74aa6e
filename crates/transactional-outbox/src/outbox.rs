//! Outbox façade: the application-facing API (§4.1, §6).

use crate::clock::{new_id, Clock, SystemClock};
use crate::config::EngineConfig;
use crate::context::{merge_context, ContextProvider, KeyExtractor};
use crate::coordinator::PartitionCoordinator;
use crate::error::{OutboxError, OutboxResult};
use crate::fallback::FallbackInvoker;
use crate::handler::{FallbackHandler, Handler, HandlerKind, HandlerRegistry, HandlerRegistryBuilder};
use crate::hash::partition_for_key;
use crate::instance_registry::InstanceRegistry;
use crate::invoker::{HandlerInvoker, ScopeFactory};
use crate::record::OutboxRecord;
use crate::retry::{RetryPolicy, RetryPolicyRegistry};
use crate::scheduler::ProcessingScheduler;
use crate::store::{InstanceStore, PartitionStore, RecordStore};
use sqlx::{Postgres, Transaction};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// Options accepted by [`Outbox::schedule`]; every field is optional and falls back to the
/// registry's resolution rules from §4.1.
#[derive(Default)]
pub struct ScheduleOptions {
    pub key: Option<String>,
    pub record_type: Option<String>,
    pub handler_id: Option<String>,
    pub context: BTreeMap<String, String>,
}

/// Accumulates handler/fallback registrations before [`OutboxBuilder::build`] freezes them.
pub struct OutboxBuilder {
    handlers: HandlerRegistryBuilder,
    config: EngineConfig,
    scope_factories: Vec<Arc<dyn ScopeFactory>>,
    context_providers: Vec<Arc<dyn ContextProvider>>,
    key_extractors: HashMap<String, Arc<dyn KeyExtractor>>,
}

impl OutboxBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            handlers: HandlerRegistryBuilder::new(),
            config,
            scope_factories: Vec::new(),
            context_providers: Vec::new(),
            key_extractors: HashMap::new(),
        }
    }

    pub fn register_handler(mut self, handler_id: impl Into<String>, kind: HandlerKind) -> Self {
        self.handlers = self.handlers.register_handler(handler_id, kind);
        self
    }

    pub fn register_fallback(mut self, handler_id: impl Into<String>, record_type: Option<String>, fallback: Arc<dyn FallbackHandler>) -> Self {
        self.handlers = self.handlers.register_fallback(handler_id, record_type, fallback);
        self
    }

    pub fn with_scope_factory(mut self, factory: Arc<dyn ScopeFactory>) -> Self {
        self.scope_factories.push(factory);
        self
    }

    /// Register a global context provider, consulted for every `schedule()` call (§4.1 step 4).
    pub fn with_context_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.context_providers.push(provider);
        self
    }

    /// Register a key extractor for a given record type, consulted when `schedule()`'s caller
    /// omits a key (§4.1 step 2).
    pub fn with_key_extractor(mut self, record_type: impl Into<String>, extractor: Arc<dyn KeyExtractor>) -> Self {
        self.key_extractors.insert(record_type.into(), extractor);
        self
    }

    pub fn build(
        self,
        record_store: Arc<dyn RecordStore>,
        instance_store: Arc<dyn InstanceStore>,
        partition_store: Arc<dyn PartitionStore>,
    ) -> Outbox {
        Outbox::new(
            self.config,
            self.handlers.build(),
            self.scope_factories,
            self.context_providers,
            self.key_extractors,
            record_store,
            instance_store,
            partition_store,
        )
    }
}

/// The embedded engine: enqueues records in the caller's transaction and, once started, runs the
/// instance registry, partition coordinator, and processing scheduler as background tasks.
pub struct Outbox {
    config: EngineConfig,
    handlers: Arc<HandlerRegistry>,
    context_providers: Vec<Arc<dyn ContextProvider>>,
    key_extractors: HashMap<String, Arc<dyn KeyExtractor>>,
    record_store: Arc<dyn RecordStore>,
    instances: Arc<InstanceRegistry>,
    coordinator: Arc<PartitionCoordinator>,
    scheduler: Arc<ProcessingScheduler>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Outbox {
    #[allow(clippy::too_many_arguments)]
    fn new(
        config: EngineConfig,
        handlers: HandlerRegistry,
        scope_factories: Vec<Arc<dyn ScopeFactory>>,
        context_providers: Vec<Arc<dyn ContextProvider>>,
        key_extractors: HashMap<String, Arc<dyn KeyExtractor>>,
        record_store: Arc<dyn RecordStore>,
        instance_store: Arc<dyn InstanceStore>,
        partition_store: Arc<dyn PartitionStore>,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let handlers = Arc::new(handlers);

        let instances = Arc::new(InstanceRegistry::new(
            instance_store,
            clock.clone(),
            config.hostname.clone(),
            config.port,
            config.instance.stale_timeout(),
            config.instance.graceful_shutdown_timeout(),
        ));
        let coordinator = Arc::new(PartitionCoordinator::new(partition_store, instances.clone(), clock.clone()));

        let invoker = Arc::new(HandlerInvoker::new(handlers.clone(), scope_factories));
        let retry_policies = Arc::new(RetryPolicyRegistry::new(config.retry_default.into_policy()));
        let fallback_invoker = Arc::new(FallbackInvoker::new(handlers.clone()));
        let chain = Arc::new(crate::chain::ProcessorChain::new(
            record_store.clone(),
            invoker,
            retry_policies,
            fallback_invoker,
            clock.clone(),
            config.processing.delete_completed_records,
        ));

        let scheduler = Arc::new(ProcessingScheduler::new(
            record_store.clone(),
            coordinator.clone(),
            chain,
            clock.clone(),
            config.build_poll_trigger(),
            config.processing.batch_size,
            config.processing.stop_on_key_failure,
            config.processing.ignore_record_keys_with_previous_failure,
            config.concurrency.worker_limit,
        ));

        Self {
            config,
            handlers,
            context_providers,
            key_extractors,
            record_store,
            instances,
            coordinator,
            scheduler,
            clock,
            shutdown: CancellationToken::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Register a new record inside the caller's transaction (§4.1). `opts.handler_id` must
    /// resolve, else `schedule()` fails with `NoMatchingHandler`; whether that id is actually
    /// registered is a separate, processing-time question (§4.2's `UnknownHandler`, fatal for that
    /// record alone) resolved by the poll loop, not here.
    #[instrument(skip(self, tx, payload, opts), fields(handler_id = opts.handler_id.as_deref().unwrap_or("<unset>")))]
    pub async fn schedule(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payload: Vec<u8>,
        opts: ScheduleOptions,
    ) -> OutboxResult<String> {
        let handler_id = opts
            .handler_id
            .or_else(|| opts.record_type.clone())
            .ok_or(OutboxError::NoMatchingHandler(opts.record_type.clone()))?;

        let record_type = opts.record_type.unwrap_or_else(|| handler_id.clone());

        let key = opts.key.or_else(|| self.key_extractors.get(&record_type).and_then(|e| e.extract(&payload))).unwrap_or_else(new_id);
        let partition = partition_for_key(&key);
        let context = merge_context(&self.context_providers, &record_type, &payload, opts.context);
        let now = self.clock.now();
        let id = new_id();

        let record = OutboxRecord::new(id.clone(), key, partition, handler_id, record_type, payload, now, context);
        self.record_store.insert(tx, &record).await?;

        info!(record_id = %id, partition, "record scheduled");
        Ok(id)
    }

    /// Start the instance registry heartbeat loop, the coordinator, and the processing scheduler
    /// as background tasks. Idempotent only in the sense that calling it twice spawns a second
    /// set of loops; callers own a single `Outbox` per process.
    pub async fn start(self: &Arc<Self>) -> OutboxResult<()> {
        self.instances.register().await?;
        self.coordinator.rebalance().await?;

        let mut tasks = self.tasks.lock().expect("tasks mutex poisoned");

        tasks.push(self.spawn_heartbeat_loop());
        tasks.push(self.spawn_rebalance_loop());
        tasks.push(self.spawn_scheduler_loop());

        Ok(())
    }

    fn spawn_heartbeat_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let interval = this.config.instance.heartbeat_interval();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.cancelled() => break,
                }
                if let Err(error) = this.instances.heartbeat().await {
                    tracing::warn!(error = %error, "heartbeat failed");
                }
                match this.instances.detect_stale().await {
                    Ok(reaped) if !reaped.is_empty() => this.coordinator.signal_rebalance(),
                    Ok(_) => {}
                    Err(error) => tracing::warn!(error = %error, "stale detection failed"),
                }
            }
        })
    }

    fn spawn_rebalance_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.coordinator.wait_for_signal() => {}
                    _ = shutdown.cancelled() => break,
                }
                if let Err(error) = this.coordinator.rebalance().await {
                    tracing::warn!(error = %error, "rebalance failed");
                }
            }
        })
    }

    fn spawn_scheduler_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move { this.scheduler.run(shutdown).await })
    }

    /// Signal all background loops to stop, wait for them, then gracefully remove this instance's
    /// registration row (§4.10).
    pub async fn stop(&self) -> OutboxResult<()> {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().expect("tasks mutex poisoned"));
        for handle in handles {
            let _ = handle.await;
        }
        self.instances.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Metadata;
    use async_trait::async_trait;

    struct NoopHandler;
    #[async_trait]
    impl Handler for NoopHandler {
        async fn handle(&self, _payload: &[u8], _metadata: &Metadata) -> OutboxResult<()> {
            Ok(())
        }
    }

    #[test]
    fn builder_composes_handlers_and_config() {
        let builder = OutboxBuilder::new(EngineConfig::default()).register_handler(
            "h1",
            HandlerKind::Generic { handler: Arc::new(NoopHandler) },
        );
        assert!(builder.handlers.build().contains("h1"));
    }

    struct FirstByteKeyExtractor;
    impl KeyExtractor for FirstByteKeyExtractor {
        fn extract(&self, payload: &[u8]) -> Option<String> {
            payload.first().map(|b| b.to_string())
        }
    }

    #[test]
    fn builder_registers_key_extractor_per_record_type() {
        let builder = OutboxBuilder::new(EngineConfig::default()).with_key_extractor("OrderCreated", Arc::new(FirstByteKeyExtractor));
        let extractor = builder.key_extractors.get("OrderCreated").expect("extractor registered");
        assert_eq!(extractor.extract(&[42]), Some("42".to_string()));
        assert_eq!(builder.key_extractors.get("OtherKind"), None);
    }

    // `schedule()`'s full behavior (unknown-handler rejection, partition assignment, transaction
    // enlistment) is covered by the crate's integration tests against a live Postgres instance
    // (see tests/), since it requires a real `sqlx::Transaction`.
}
