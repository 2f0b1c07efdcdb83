//! Retry caps, backoff delays and queue priorities

use crate::config::RetryConfig;
use crate::extraction::model::Trigger;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Queue priority. Lower number drains first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Initial,
    Manual,
    Sweep,
}

impl Priority {
    pub fn value(&self) -> u8 {
        match self {
            Priority::Initial => 0,
            Priority::Manual => 3,
            Priority::Sweep => 6,
        }
    }

    /// Closest class for a caller supplied numeric priority
    pub fn from_value(value: u8) -> Self {
        match value {
            0..=2 => Priority::Initial,
            3..=5 => Priority::Manual,
            _ => Priority::Sweep,
        }
    }

    pub fn for_trigger(trigger: Trigger) -> Self {
        match trigger {
            Trigger::Upload | Trigger::Automatic => Priority::Initial,
            Trigger::Manual => Priority::Manual,
            Trigger::Sweep => Priority::Sweep,
        }
    }
}

/// Caps and backoff schedule for the three retry classes
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub auto_max_attempts: i32,
    pub manual_cap: i32,
    pub sweep_cap: i32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            auto_max_attempts: config.auto_max_attempts,
            manual_cap: config.manual_cap,
            sweep_cap: config.sweep_cap,
            initial_delay: Duration::from_secs(config.initial_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }

    /// No waiting between attempts
    pub fn immediate(config: &RetryConfig) -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
            ..Self::from_config(config)
        }
    }

    /// Countdown before automatic attempt number `failures + 1`, where
    /// `failures` counts the failed attempts so far (1-based).
    pub fn delay_for(&self, failures: i32) -> Duration {
        let mut schedule = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_delay)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(self.jitter)
            .with_max_interval(self.max_delay)
            .with_max_elapsed_time(None)
            .build();

        let mut delay = Duration::ZERO;
        for _ in 0..failures.max(1) {
            delay = schedule.next_backoff().unwrap_or(self.max_delay);
        }
        delay.min(self.max_delay)
    }

    /// Whether another automatic attempt is allowed after `failures` failures
    pub fn should_retry_automatically(&self, failures: i32) -> bool {
        failures < self.auto_max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Initial.value() < Priority::Manual.value());
        assert!(Priority::Manual.value() < Priority::Sweep.value());
        assert_eq!(Priority::from_value(Priority::Manual.value()), Priority::Manual);
        assert_eq!(Priority::for_trigger(Trigger::Sweep), Priority::Sweep);
    }

    #[test]
    fn test_delays_grow_and_cap() {
        let config = RetryConfig {
            jitter: 0.0,
            ..RetryConfig::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.delay_for(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for(3), Duration::from_secs(120));
        assert_eq!(policy.delay_for(10), Duration::from_secs(600));
    }

    #[test]
    fn test_jitter_stays_within_cap() {
        let policy = RetryPolicy::default();
        for failures in 1..=8 {
            assert!(policy.delay_for(failures) <= Duration::from_secs(600));
        }
        let first = policy.delay_for(1);
        assert!(first >= Duration::from_secs(24) && first <= Duration::from_secs(36));
    }

    #[test]
    fn test_immediate_policy() {
        let policy = RetryPolicy::immediate(&RetryConfig::default());
        assert_eq!(policy.delay_for(3), Duration::ZERO);
        assert_eq!(policy.auto_max_attempts, 5);
    }

    #[test]
    fn test_automatic_cap() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry_automatically(4));
        assert!(!policy.should_retry_automatically(5));
    }
}
