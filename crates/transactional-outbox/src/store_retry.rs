//! Bounded, jittered retry around a single store round-trip, built on top of the sibling
//! `resilience` crate's generic [`resilience::with_retry`]. This is defense-in-depth for a
//! connection blip inside one coordinator or scheduler pass; it is distinct from the
//! handler-level [`crate::retry::RetryPolicy`], which governs redelivery of a whole record and is
//! persisted on the record itself.

use crate::error::{OutboxError, OutboxResult};
use resilience::{with_retry, RetryConfig, RetryError};
use std::time::Duration;

fn store_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 2,
        initial_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(200),
        backoff_multiplier: 2.0,
        jitter: true,
    }
}

/// Run `f` with a short bounded retry, collapsing any exhausted-retry outcome into
/// [`OutboxError::TransientStoreError`]. Intended for idempotent reads and the few store writes
/// (`ensure_bootstrapped`) that are themselves already idempotent; CAS claim/release calls are
/// deliberately left unwrapped since a spurious retry there would just contend with itself.
pub async fn with_store_retry<F, Fut, T>(f: F) -> OutboxResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = OutboxResult<T>>,
{
    with_retry(store_retry_config(), f).await.map_err(|err| match err {
        RetryError::MaxRetriesExceeded(n) => {
            OutboxError::TransientStoreError(format!("store operation did not succeed after {n} retries"))
        }
        RetryError::OperationFailed(e) => e,
    })
}
