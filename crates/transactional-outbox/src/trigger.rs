//! Poll trigger: decides how long to wait before the scheduler's next tick (§4.8).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Policy controlling the delay between scheduler ticks.
pub enum PollTrigger {
    /// Always wait the same fixed delay.
    Fixed { delay: Duration },
    /// Backs off under light load, speeds up under full batches, bounded to `[min_delay,
    /// max_delay]`.
    Adaptive {
        min_delay: Duration,
        max_delay: Duration,
        batch_size: i64,
        current_millis: AtomicU64,
    },
}

impl PollTrigger {
    pub fn fixed(delay: Duration) -> Self {
        PollTrigger::Fixed { delay }
    }

    pub fn adaptive(min_delay: Duration, max_delay: Duration, batch_size: i64) -> Self {
        PollTrigger::Adaptive {
            min_delay,
            max_delay,
            batch_size,
            current_millis: AtomicU64::new(min_delay.as_millis() as u64),
        }
    }

    /// The delay to wait before the next tick, given how many records the tick just completed
    /// processed.
    pub fn on_tick_complete(&self, record_count: i64) -> Duration {
        match self {
            PollTrigger::Fixed { delay } => *delay,
            PollTrigger::Adaptive {
                min_delay,
                max_delay,
                batch_size,
                current_millis,
            } => {
                let min_ms = min_delay.as_millis() as u64;
                let max_ms = max_delay.as_millis() as u64;
                let current = current_millis.load(Ordering::SeqCst);

                let next = if record_count <= batch_size / 4 {
                    (current.saturating_mul(2)).min(max_ms)
                } else if record_count >= *batch_size {
                    (current / 2).max(min_ms)
                } else {
                    current
                };

                current_millis.store(next, Ordering::SeqCst);
                Duration::from_millis(next)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_trigger_never_changes() {
        let trigger = PollTrigger::fixed(Duration::from_millis(250));
        assert_eq!(trigger.on_tick_complete(0), Duration::from_millis(250));
        assert_eq!(trigger.on_tick_complete(1000), Duration::from_millis(250));
    }

    #[test]
    fn adaptive_trigger_backs_off_when_idle() {
        let trigger = PollTrigger::adaptive(Duration::from_millis(100), Duration::from_millis(5000), 100);
        assert_eq!(trigger.on_tick_complete(0), Duration::from_millis(200));
        assert_eq!(trigger.on_tick_complete(0), Duration::from_millis(400));
    }

    #[test]
    fn adaptive_trigger_speeds_up_on_full_batch() {
        let trigger = PollTrigger::adaptive(Duration::from_millis(100), Duration::from_millis(5000), 100);
        // Push it up first.
        trigger.on_tick_complete(0);
        trigger.on_tick_complete(0);
        assert_eq!(trigger.on_tick_complete(100), Duration::from_millis(200));
    }

    #[test]
    fn adaptive_trigger_stays_within_bounds() {
        let trigger = PollTrigger::adaptive(Duration::from_millis(100), Duration::from_millis(400), 100);
        for _ in 0..10 {
            trigger.on_tick_complete(0);
        }
        assert_eq!(trigger.on_tick_complete(0), Duration::from_millis(400));
        for _ in 0..10 {
            trigger.on_tick_complete(100);
        }
        assert_eq!(trigger.on_tick_complete(100), Duration::from_millis(100));
    }

    #[test]
    fn adaptive_trigger_holds_steady_between_thresholds() {
        let trigger = PollTrigger::adaptive(Duration::from_millis(100), Duration::from_millis(5000), 100);
        assert_eq!(trigger.on_tick_complete(50), Duration::from_millis(100));
    }
}
