//! Prometheus metrics for the engine. Registered against the process-wide default registry,
//! matching the teacher library's `OutboxMetrics::new` pattern; shipping them to a collector is
//! left to the host.

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct OutboxMetrics {
    /// Records processed per tick, labeled by outcome (`completed`, `rescheduled`, `failed`).
    pub records_processed: IntCounterVec,
    /// Number of partitions owned by this instance after the latest rebalance.
    pub partitions_owned: IntGauge,
    /// Rebalance rounds run, labeled by whether any claim/release happened.
    pub rebalance_rounds: IntCounterVec,
    /// Handler invocation latency in seconds, labeled by `handler_id`.
    pub handler_latency_seconds: HistogramVec,
}

impl OutboxMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let records_processed = IntCounterVec::new(
            Opts::new("outbox_records_processed_total", "Outbox records processed, by outcome")
                .const_label("service", service.to_string()),
            &["outcome"],
        )
        .expect("valid metric opts for outbox_records_processed_total");

        let partitions_owned = IntGauge::with_opts(
            Opts::new("outbox_partitions_owned", "Partitions currently owned by this instance")
                .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_partitions_owned");

        let rebalance_rounds = IntCounterVec::new(
            Opts::new("outbox_rebalance_rounds_total", "Partition coordinator rebalance rounds run")
                .const_label("service", service.to_string()),
            &["changed"],
        )
        .expect("valid metric opts for outbox_rebalance_rounds_total");

        let handler_latency_seconds = HistogramVec::new(
            HistogramOpts::new("outbox_handler_latency_seconds", "Handler invocation latency in seconds")
                .const_label("service", service.to_string()),
            &["handler_id"],
        )
        .expect("valid metric opts for outbox_handler_latency_seconds");

        for metric in [
            Box::new(records_processed.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(partitions_owned.clone()),
            Box::new(rebalance_rounds.clone()),
            Box::new(handler_latency_seconds.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("failed to register outbox metric: {}", e);
            }
        }

        Self {
            records_processed,
            partitions_owned,
            rebalance_rounds,
            handler_latency_seconds,
        }
    }
}
