//! Instance lifecycle: registration, heartbeats, stale detection, graceful shutdown (§4.10).

use crate::clock::{new_id, Clock};
use crate::error::OutboxResult;
use crate::instance::OutboxInstance;
use crate::store::InstanceStore;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{info, instrument, warn};

/// Runs the single scheduled task that keeps this process's liveness row current and reaps dead
/// peers, matching §4.10's "a single scheduled task runs both heartbeat and stale-cleanup".
pub struct InstanceRegistry {
    store: Arc<dyn InstanceStore>,
    clock: Arc<dyn Clock>,
    instance_id: String,
    hostname: String,
    port: u16,
    stale_timeout: chrono::Duration,
    graceful_shutdown_timeout: StdDuration,
}

impl InstanceRegistry {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        clock: Arc<dyn Clock>,
        hostname: String,
        port: u16,
        stale_timeout: chrono::Duration,
        graceful_shutdown_timeout: StdDuration,
    ) -> Self {
        Self {
            store,
            clock,
            instance_id: new_id(),
            hostname,
            port,
            stale_timeout,
            graceful_shutdown_timeout,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn register(&self) -> OutboxResult<()> {
        let now = self.clock.now();
        let instance = OutboxInstance::new(self.instance_id.clone(), self.hostname.clone(), self.port, now);
        self.store.register(&instance).await?;
        info!(instance_id = %self.instance_id, hostname = %self.hostname, port = self.port, "instance registered");
        Ok(())
    }

    /// Bump `last_heartbeat`. If the row was missing (e.g. reaped as stale by a peer while this
    /// instance was merely slow), re-register.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn heartbeat(&self) -> OutboxResult<()> {
        let now = self.clock.now();
        let affected = self.store.heartbeat(&self.instance_id, now).await?;
        if affected == 0 {
            warn!(instance_id = %self.instance_id, "heartbeat found no row, re-registering");
            self.register().await?;
        }
        Ok(())
    }

    /// Delete any instance row whose heartbeat is older than `stale_timeout`, including this
    /// instance's own row if somehow stale (defensive; should not happen while `heartbeat` runs on
    /// schedule).
    #[instrument(skip(self))]
    pub async fn detect_stale(&self) -> OutboxResult<Vec<String>> {
        let now = self.clock.now();
        let stale = self.store.list_stale(now, self.stale_timeout).await?;
        let mut reaped = Vec::with_capacity(stale.len());
        for instance in stale {
            self.store.delete(&instance.instance_id).await?;
            warn!(instance_id = %instance.instance_id, "reaped stale instance");
            reaped.push(instance.instance_id);
        }
        Ok(reaped)
    }

    /// Read the currently live instance set (excludes those marked `SHUTTING_DOWN`).
    pub async fn list_active(&self) -> OutboxResult<Vec<OutboxInstance>> {
        self.store.list_active().await
    }

    /// Mark this instance `SHUTTING_DOWN`, give peers `graceful_shutdown_timeout` to observe it and
    /// stop routing work here, then delete the row.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn shutdown(&self) -> OutboxResult<()> {
        let now = self.clock.now();
        self.store.mark_shutting_down(&self.instance_id, now).await?;
        tokio::time::sleep(self.graceful_shutdown_timeout).await;
        self.store.delete(&self.instance_id).await?;
        info!(instance_id = %self.instance_id, "instance shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::instance::InstanceStatus;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeInstanceStore {
        rows: Mutex<HashMap<String, OutboxInstance>>,
    }

    #[async_trait]
    impl InstanceStore for FakeInstanceStore {
        async fn register(&self, instance: &OutboxInstance) -> OutboxResult<()> {
            self.rows.lock().insert(instance.instance_id.clone(), instance.clone());
            Ok(())
        }
        async fn heartbeat(&self, instance_id: &str, now: DateTime<Utc>) -> OutboxResult<u64> {
            let mut rows = self.rows.lock();
            match rows.get_mut(instance_id) {
                Some(row) => {
                    row.last_heartbeat = now;
                    Ok(1)
                }
                None => Ok(0),
            }
        }
        async fn list_active(&self) -> OutboxResult<Vec<OutboxInstance>> {
            Ok(self.rows.lock().values().filter(|i| i.status != InstanceStatus::ShuttingDown).cloned().collect())
        }
        async fn mark_shutting_down(&self, instance_id: &str, now: DateTime<Utc>) -> OutboxResult<()> {
            if let Some(row) = self.rows.lock().get_mut(instance_id) {
                row.status = InstanceStatus::ShuttingDown;
                row.updated_at = now;
            }
            Ok(())
        }
        async fn delete(&self, instance_id: &str) -> OutboxResult<()> {
            self.rows.lock().remove(instance_id);
            Ok(())
        }
        async fn list_stale(&self, now: DateTime<Utc>, stale_timeout: chrono::Duration) -> OutboxResult<Vec<OutboxInstance>> {
            let cutoff = now - stale_timeout;
            Ok(self.rows.lock().values().filter(|i| i.last_heartbeat < cutoff).cloned().collect())
        }
    }

    #[tokio::test]
    async fn register_then_heartbeat_succeeds() {
        let store = Arc::new(FakeInstanceStore::default());
        let clock = Arc::new(TestClock::new(Utc::now()));
        let registry = InstanceRegistry::new(store, clock, "localhost".into(), 8080, chrono::Duration::seconds(30), StdDuration::from_millis(0));
        registry.register().await.unwrap();
        registry.heartbeat().await.unwrap();
    }

    #[tokio::test]
    async fn heartbeat_after_row_deleted_reregisters() {
        let store = Arc::new(FakeInstanceStore::default());
        let clock = Arc::new(TestClock::new(Utc::now()));
        let registry = InstanceRegistry::new(store.clone(), clock, "localhost".into(), 8080, chrono::Duration::seconds(30), StdDuration::from_millis(0));
        registry.register().await.unwrap();
        store.rows.lock().remove(registry.instance_id());
        registry.heartbeat().await.unwrap();
        assert!(store.rows.lock().contains_key(registry.instance_id()));
    }

    #[tokio::test]
    async fn detect_stale_reaps_old_rows() {
        let store = Arc::new(FakeInstanceStore::default());
        let clock = Arc::new(TestClock::new(Utc::now()));
        let registry = InstanceRegistry::new(store.clone(), clock.clone(), "localhost".into(), 8080, chrono::Duration::seconds(30), StdDuration::from_millis(0));
        registry.register().await.unwrap();
        clock.advance(chrono::Duration::seconds(60));
        let reaped = registry.detect_stale().await.unwrap();
        assert_eq!(reaped, vec![registry.instance_id().to_string()]);
        assert!(store.rows.lock().is_empty());
    }
}
