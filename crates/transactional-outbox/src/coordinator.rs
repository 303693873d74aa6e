//! Partition coordinator: distributes the 256 fixed partitions across the live fleet (§4.11).

use crate::clock::Clock;
use crate::error::OutboxResult;
use crate::hash::PARTITION_COUNT;
use crate::instance_registry::InstanceRegistry;
use crate::partition::{PartitionAssignment, PartitionClass};
use crate::store::PartitionStore;
use crate::store_retry::with_store_retry;
use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, instrument};

/// Owns the atomic snapshot of partitions claimed by this instance and runs the CAS-based
/// rebalance algorithm. The scheduler only ever reads `owned()`; only `rebalance()` writes it,
/// keeping data flow unidirectional per §9's redesign note.
pub struct PartitionCoordinator {
    store: Arc<dyn PartitionStore>,
    instances: Arc<InstanceRegistry>,
    clock: Arc<dyn Clock>,
    self_id: String,
    owned: ArcSwap<HashSet<u16>>,
    rebalance_signal: Notify,
}

impl PartitionCoordinator {
    pub fn new(store: Arc<dyn PartitionStore>, instances: Arc<InstanceRegistry>, clock: Arc<dyn Clock>) -> Self {
        let self_id = instances.instance_id().to_string();
        Self {
            store,
            instances,
            clock,
            self_id,
            owned: ArcSwap::from_pointee(HashSet::new()),
            rebalance_signal: Notify::new(),
        }
    }

    /// The partitions owned by this instance right now, per the latest completed rebalance.
    pub fn owned(&self) -> Arc<HashSet<u16>> {
        self.owned.load_full()
    }

    /// Level-trigger a rebalance at the next opportunity. Safe to call from any task observing a
    /// membership change, ownership loss, or at startup.
    pub fn signal_rebalance(&self) {
        self.rebalance_signal.notify_one();
    }

    /// Block until a rebalance has been requested.
    pub async fn wait_for_signal(&self) {
        self.rebalance_signal.notified().await;
    }

    /// Run one rebalance round, per §4.11's numbered algorithm.
    #[instrument(skip(self), fields(self_id = %self.self_id))]
    pub async fn rebalance(&self) -> OutboxResult<()> {
        let now = self.clock.now();
        with_store_retry(|| self.store.ensure_bootstrapped(now)).await?;

        let live_instances = self.instances.list_active().await?;
        let live_ids: HashSet<String> = live_instances.iter().map(|i| i.instance_id.clone()).collect();
        if !live_ids.contains(&self.self_id) {
            // Self not yet visible in its own read (registration race); nothing to claim this round.
            return Ok(());
        }

        let assignments = with_store_retry(|| self.store.list_all()).await?;
        let mut mine: Vec<PartitionAssignment> = Vec::new();
        let mut stale: Vec<PartitionAssignment> = Vec::new();
        let mut foreign_alive_count = 0usize;

        for assignment in assignments {
            match assignment.classify(&self.self_id, &live_ids) {
                PartitionClass::Mine => mine.push(assignment),
                PartitionClass::ForeignAlive => foreign_alive_count += 1,
                PartitionClass::Stale => stale.push(assignment),
            }
        }

        let mine_target = target_count_for(&self.self_id, &live_ids);

        if mine.len() < mine_target {
            let need = mine_target - mine.len();
            for candidate in stale.into_iter().take(need) {
                match self
                    .store
                    .cas_claim(candidate.partition_number, candidate.version, &self.self_id, now)
                    .await
                {
                    Ok(true) => info!(partition = candidate.partition_number, "claimed partition"),
                    Ok(false) => {} // lost the race, retried on next signal
                    Err(err) => return Err(err),
                }
            }
        } else if mine.len() > mine_target {
            let excess = mine.len() - mine_target;
            // §4.11 step 6 oscillation guard: only release when there's enough non-mine capacity
            // (foreign-alive + stale) to actually absorb what we give up.
            if foreign_alive_count + stale.len() < PARTITION_COUNT as usize - mine_target {
                for candidate in mine.iter().take(excess) {
                    match self.store.cas_release(candidate.partition_number, candidate.version, now).await {
                        Ok(true) => info!(partition = candidate.partition_number, "released partition"),
                        Ok(false) => {}
                        Err(err) => return Err(err),
                    }
                }
            }
        }

        let refreshed = with_store_retry(|| self.store.list_all()).await?;
        let newly_owned: HashSet<u16> = refreshed
            .into_iter()
            .filter(|a| a.instance_id.as_deref() == Some(self.self_id.as_str()))
            .map(|a| a.partition_number)
            .collect();
        self.owned.store(Arc::new(newly_owned));

        Ok(())
    }
}

/// Deterministic target partition count for `instance_id`: `ceil(256/n)` for the first
/// `256 mod n` instances (by sorted id), `floor(256/n)` for the rest.
fn target_count_for(instance_id: &str, live_ids: &HashSet<String>) -> usize {
    let n = live_ids.len();
    if n == 0 {
        return 0;
    }
    let mut sorted: Vec<&String> = live_ids.iter().collect();
    sorted.sort();
    let base = PARTITION_COUNT as usize / n;
    let remainder = PARTITION_COUNT as usize % n;
    match sorted.iter().position(|id| id.as_str() == instance_id) {
        Some(index) if index < remainder => base + 1,
        Some(_) => base,
        None => 0,
    }
}
