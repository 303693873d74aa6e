//! Engine configuration: every tunable knob enumerated in the external interfaces contract (§6),
//! loaded via the `config` crate's layered source (defaults -> optional file -> `OUTBOX_`-prefixed
//! environment overlay), matching the source ecosystem's `config`/`envy` idiom.

use crate::error::{OutboxError, OutboxResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum PollTriggerConfig {
    Fixed { interval_ms: u64 },
    Adaptive { min_interval_ms: u64, max_interval_ms: u64 },
}

impl Default for PollTriggerConfig {
    fn default() -> Self {
        PollTriggerConfig::Fixed { interval_ms: 500 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum RetryPolicyConfig {
    Fixed { delay_ms: u64, max_attempts: i32 },
    Exponential { initial_delay_ms: u64, max_delay_ms: u64, multiplier: f64, max_attempts: i32 },
    Jittered { base_delay_ms: u64, max_delay_ms: u64, multiplier: f64, jitter_ms: u64, max_attempts: i32 },
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        RetryPolicyConfig::Exponential {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl RetryPolicyConfig {
    pub fn into_policy(self) -> crate::retry::RetryPolicy {
        match self {
            RetryPolicyConfig::Fixed { delay_ms, max_attempts } => crate::retry::RetryPolicy::Fixed {
                delay: chrono::Duration::milliseconds(delay_ms as i64),
                max_attempts,
            },
            RetryPolicyConfig::Exponential { initial_delay_ms, max_delay_ms, multiplier, max_attempts } => {
                crate::retry::RetryPolicy::Exponential {
                    initial: chrono::Duration::milliseconds(initial_delay_ms as i64),
                    max: chrono::Duration::milliseconds(max_delay_ms as i64),
                    multiplier,
                    max_attempts,
                }
            }
            RetryPolicyConfig::Jittered { base_delay_ms, max_delay_ms, multiplier, jitter_ms, max_attempts } => {
                crate::retry::RetryPolicy::Jittered {
                    base: chrono::Duration::milliseconds(base_delay_ms as i64),
                    max: chrono::Duration::milliseconds(max_delay_ms as i64),
                    multiplier,
                    jitter: chrono::Duration::milliseconds(jitter_ms as i64),
                    max_attempts,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub delete_completed_records: bool,
    pub stop_on_key_failure: bool,
    pub ignore_record_keys_with_previous_failure: bool,
    pub batch_size: i64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            delete_completed_records: true,
            stop_on_key_failure: true,
            ignore_record_keys_with_previous_failure: false,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub heartbeat_interval_ms: u64,
    pub stale_timeout_ms: u64,
    pub graceful_shutdown_timeout_ms: u64,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 10_000,
            stale_timeout_ms: 30_000,
            graceful_shutdown_timeout_ms: 5_000,
        }
    }
}

impl InstanceConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn stale_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.stale_timeout_ms as i64)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub worker_limit: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { worker_limit: 16 }
    }
}

/// Top-level configuration for an engine instance, per §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub poll_trigger: PollTriggerConfig,
    pub processing: ProcessingConfig,
    pub retry_default: RetryPolicyConfig,
    pub instance: InstanceConfig,
    pub concurrency: ConcurrencyConfig,
    pub hostname: String,
    pub port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_trigger: PollTriggerConfig::default(),
            processing: ProcessingConfig::default(),
            retry_default: RetryPolicyConfig::default(),
            instance: InstanceConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            hostname: "localhost".to_string(),
            port: 0,
        }
    }
}

impl EngineConfig {
    /// Load layered config: built-in defaults, an optional TOML file, then environment variables
    /// prefixed `OUTBOX_` (double-underscore separated for nesting, e.g.
    /// `OUTBOX_PROCESSING__BATCH_SIZE=200`).
    pub fn load(file_path: Option<&str>) -> OutboxResult<Self> {
        let defaults = EngineConfig::default();
        let defaults_value =
            config::Config::try_from(&defaults).map_err(|e| OutboxError::Config(e.to_string()))?;

        let mut builder = config::Config::builder().add_source(defaults_value);
        if let Some(path) = file_path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("OUTBOX")
                .separator("__")
                .try_parsing(true),
        );

        let built = builder.build().map_err(|e| OutboxError::Config(e.to_string()))?;
        built.try_deserialize().map_err(|e| OutboxError::Config(e.to_string()))
    }

    pub fn build_poll_trigger(&self) -> crate::trigger::PollTrigger {
        match self.poll_trigger {
            PollTriggerConfig::Fixed { interval_ms } => crate::trigger::PollTrigger::fixed(Duration::from_millis(interval_ms)),
            PollTriggerConfig::Adaptive { min_interval_ms, max_interval_ms } => crate::trigger::PollTrigger::adaptive(
                Duration::from_millis(min_interval_ms),
                Duration::from_millis(max_interval_ms),
                self.processing.batch_size,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_values() {
        let config = EngineConfig::default();
        assert_eq!(config.instance.heartbeat_interval_ms, 10_000);
        assert_eq!(config.instance.stale_timeout_ms, 30_000);
        assert_eq!(config.processing.batch_size, 100);
        assert!(config.processing.delete_completed_records);
        assert!(config.processing.stop_on_key_failure);
    }

    #[test]
    fn load_with_no_file_falls_back_to_defaults() {
        let config = EngineConfig::load(None).unwrap();
        assert_eq!(config.processing.batch_size, 100);
    }
}
