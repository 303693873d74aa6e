//! Retry policies: per-handler decisions on whether and when to retry a failed delivery.

use crate::error::OutboxError;
use chrono::Duration;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;

/// A retry policy bound to a handler-id, mirroring §4.3/§3's `RetryPolicy` value object.
#[derive(Debug, Clone)]
pub enum RetryPolicy {
    /// Constant delay between attempts.
    Fixed { delay: Duration, max_attempts: i32 },
    /// Delay grows by `multiplier` each attempt, capped at `max`.
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
        max_attempts: i32,
    },
    /// Exponential-style base delay plus a uniform random jitter in `[0, jitter)`.
    Jittered {
        base: Duration,
        max: Duration,
        multiplier: f64,
        jitter: Duration,
        max_attempts: i32,
    },
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> i32 {
        match self {
            RetryPolicy::Fixed { max_attempts, .. } => *max_attempts,
            RetryPolicy::Exponential { max_attempts, .. } => *max_attempts,
            RetryPolicy::Jittered { max_attempts, .. } => *max_attempts,
        }
    }

    /// Whether `error` is worth retrying at all. §4.9: a [`OutboxError::NonRetryable`] always
    /// short-circuits straight to fallback regardless of remaining attempts.
    pub fn should_retry(&self, error: &OutboxError) -> bool {
        !matches!(error, OutboxError::NonRetryable(_))
    }

    /// Delay before attempt `failure_count` (1-indexed: called with the post-increment count).
    /// Always clamped to `>= 0`.
    pub fn next_delay(&self, failure_count: i32) -> Duration {
        let n = failure_count.max(1);
        let delay = match self {
            RetryPolicy::Fixed { delay, .. } => *delay,
            RetryPolicy::Exponential { initial, max, multiplier, .. } => {
                exponential_delay(*initial, *max, *multiplier, n)
            }
            RetryPolicy::Jittered { base, max, multiplier, jitter, .. } => {
                let backoff = exponential_delay(*base, *max, *multiplier, n);
                let jitter_ms = jitter.num_milliseconds().max(0);
                let drawn = if jitter_ms > 0 {
                    rand::thread_rng().gen_range(0..jitter_ms)
                } else {
                    0
                };
                backoff + Duration::milliseconds(drawn)
            }
        };
        if delay < Duration::zero() {
            Duration::zero()
        } else {
            delay
        }
    }
}

fn exponential_delay(initial: Duration, max: Duration, multiplier: f64, n: i32) -> Duration {
    let initial_ms = initial.num_milliseconds() as f64;
    let scaled = initial_ms * multiplier.powi(n - 1);
    let capped = scaled.min(max.num_milliseconds() as f64).max(0.0);
    Duration::milliseconds(capped as i64)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Exponential {
            initial: Duration::milliseconds(500),
            max: Duration::seconds(30),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

/// Maps `handler_id -> RetryPolicy`, falling back to a process-wide default. Registration caches
/// the chosen policy behind a `parking_lot::RwLock`, matching the `resilience` crate's
/// copy-on-read style for rarely-mutated per-key configuration.
pub struct RetryPolicyRegistry {
    default: RetryPolicy,
    overrides: RwLock<HashMap<String, RetryPolicy>>,
}

impl RetryPolicyRegistry {
    pub fn new(default: RetryPolicy) -> Self {
        Self {
            default,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, handler_id: impl Into<String>, policy: RetryPolicy) {
        self.overrides.write().insert(handler_id.into(), policy);
    }

    pub fn policy_for(&self, handler_id: &str) -> RetryPolicy {
        self.overrides
            .read()
            .get(handler_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

impl Default for RetryPolicyRegistry {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_delay_is_constant() {
        let policy = RetryPolicy::Fixed {
            delay: Duration::seconds(5),
            max_attempts: 3,
        };
        assert_eq!(policy.next_delay(1), Duration::seconds(5));
        assert_eq!(policy.next_delay(4), Duration::seconds(5));
    }

    #[test]
    fn exponential_delay_grows_and_caps() {
        let policy = RetryPolicy::Exponential {
            initial: Duration::milliseconds(100),
            max: Duration::milliseconds(1000),
            multiplier: 2.0,
            max_attempts: 10,
        };
        assert_eq!(policy.next_delay(1), Duration::milliseconds(100));
        assert_eq!(policy.next_delay(2), Duration::milliseconds(200));
        assert_eq!(policy.next_delay(3), Duration::milliseconds(400));
        assert_eq!(policy.next_delay(10), Duration::milliseconds(1000));
    }

    #[test]
    fn jittered_delay_is_bounded() {
        let policy = RetryPolicy::Jittered {
            base: Duration::milliseconds(100),
            max: Duration::milliseconds(1000),
            multiplier: 2.0,
            jitter: Duration::milliseconds(50),
            max_attempts: 5,
        };
        for attempt in 1..=5 {
            let delay = policy.next_delay(attempt);
            assert!(delay >= Duration::zero());
            assert!(delay <= Duration::milliseconds(1050));
        }
    }

    #[test]
    fn non_retryable_error_never_retries() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(&OutboxError::NonRetryable("bad input".into())));
        assert!(policy.should_retry(&OutboxError::HandlerFailure("timeout".into())));
    }

    #[test]
    fn registry_falls_back_to_default() {
        let registry = RetryPolicyRegistry::default();
        let policy = registry.policy_for("unregistered-handler");
        assert_eq!(policy.max_attempts(), RetryPolicy::default().max_attempts());

        registry.register(
            "h1",
            RetryPolicy::Fixed {
                delay: Duration::seconds(1),
                max_attempts: 1,
            },
        );
        assert_eq!(registry.policy_for("h1").max_attempts(), 1);
    }
}
