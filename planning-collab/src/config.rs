//! Engine tuning knobs.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// Quiet period after the last applied operation before saving (default: 2s)
    pub save_debounce: Duration,
    /// Minimum gap between cursor broadcasts per user (default: 100ms)
    pub cursor_interval: Duration,
    /// Bounded command queue per document actor
    pub command_capacity: usize,
    /// Bounded event queue per transport subscriber
    pub subscriber_capacity: usize,
    /// How long a publish waits on a full subscriber before dropping the event
    pub publish_timeout: Duration,
    /// Attempts per save round before giving up until the next trigger
    pub max_save_attempts: u32,
    /// First retry delay; doubles each attempt
    pub save_backoff_base: Duration,
    pub save_backoff_max: Duration,
    /// Consecutive failed saves before the failure is surfaced to users
    pub save_failure_threshold: u32,
    /// Upper bound on operations kept for transforming stale submissions
    pub transform_window_cap: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            save_debounce: Duration::from_secs(2),
            cursor_interval: Duration::from_millis(100),
            command_capacity: 256,
            subscriber_capacity: 256,
            publish_timeout: Duration::from_secs(5),
            max_save_attempts: 5,
            save_backoff_base: Duration::from_millis(200),
            save_backoff_max: Duration::from_secs(10),
            save_failure_threshold: 3,
            transform_window_cap: 1000,
        }
    }
}

impl CollabConfig {
    /// Short timers so tests do not sleep for seconds.
    pub fn for_testing() -> Self {
        Self {
            save_debounce: Duration::from_millis(50),
            cursor_interval: Duration::from_millis(30),
            publish_timeout: Duration::from_millis(500),
            save_backoff_base: Duration::from_millis(5),
            save_backoff_max: Duration::from_millis(20),
            ..Self::default()
        }
    }

    /// Delay before retry `attempt` (1-based), capped at `save_backoff_max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.save_backoff_base.saturating_mul(factor).min(self.save_backoff_max)
    }
}
