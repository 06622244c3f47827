//! Scheduler-wide defaults and tuning knobs, loadable from TOML.
//!
//! ```toml
//! default_priority = 10
//! default_blocking = true
//! worker_threads = 16
//! estop_poll_interval_ms = 250
//!
//! [retry]
//! max_attempts = 3
//! per_attempt_timeout_ms = 1000
//! ```
//!
//! Every key is optional.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Priority of tasks submitted without one. Lower runs first.
    pub default_priority: i32,
    /// Whether tasks submitted without a `block` option suspend the caller.
    pub default_blocking: bool,
    /// Workers started up front. More are started on demand, up to one per hardware id.
    pub worker_threads: usize,
    /// Longest time an idle worker sleeps before re-checking the emergency stop.
    pub estop_poll_interval_ms: u64,
    /// How long an idle worker waits before retrying a channel that is held outside the scheduler.
    pub lock_retry_interval_ms: u64,
    pub retry: RetryConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_priority: 10,
            default_blocking: true,
            worker_threads: 16,
            estop_poll_interval_ms: 250,
            lock_retry_interval_ms: 10,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub per_attempt_timeout_ms: u64,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            per_attempt_timeout_ms: 1000,
            backoff_ms: 50,
        }
    }
}

impl SchedulerConfig {
    pub fn from_toml_str(src: &str) -> Result<Self, SchedulerError> {
        let config: Self = toml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.worker_threads == 0 {
            return Err(SchedulerError::Config(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        if !(1..=1000).contains(&self.estop_poll_interval_ms) {
            return Err(SchedulerError::Config(format!(
                "estop_poll_interval_ms must be within 1..=1000, got {}",
                self.estop_poll_interval_ms
            )));
        }
        if self.lock_retry_interval_ms == 0 {
            return Err(SchedulerError::Config(
                "lock_retry_interval_ms must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SchedulerError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn estop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.estop_poll_interval_ms)
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            per_attempt_timeout: Duration::from_millis(self.retry.per_attempt_timeout_ms),
            backoff: Duration::from_millis(self.retry.backoff_ms),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = SchedulerConfig::from_toml_str("").unwrap();
        assert_eq!(config, SchedulerConfig::default());
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn partial_document() {
        let config = SchedulerConfig::from_toml_str(
            r#"
            default_priority = 3
            worker_threads = 4

            [retry]
            max_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.default_priority, 3);
        assert_eq!(config.worker_threads, 4);
        assert!(config.default_blocking);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.per_attempt_timeout_ms, 1000);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            SchedulerConfig::from_toml_str("worker_threads = 0"),
            Err(SchedulerError::Config(_))
        ));
        assert!(matches!(
            SchedulerConfig::from_toml_str("estop_poll_interval_ms = 5000"),
            Err(SchedulerError::Config(_))
        ));
        assert!(matches!(
            SchedulerConfig::from_toml_str("worker_threads = \"many\""),
            Err(SchedulerError::ConfigParse(_))
        ));
    }
}
