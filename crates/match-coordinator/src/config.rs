//! Coordinator configuration

use crate::retry::RetryPolicy;
use ledger_types::MAX_START_LEAD_SECS;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("start_buffer_secs must be between 0 and {max}, got {got}")]
    StartBuffer { got: i64, max: i64 },
}

/// Tunables for one coordination session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Lobby polling interval when push is unavailable
    pub status_poll_interval_ms: u64,
    /// Convergence poll interval, also used as the join backstop
    pub convergence_poll_interval_ms: u64,
    pub retry: RetryPolicy,
    /// Added to the current time to form the match start timestamp
    pub start_buffer_secs: i64,
    /// Give up waiting for convergence after this long
    pub max_wait_secs: Option<u64>,
    pub confirm_poll_interval_ms: u64,
    pub confirm_max_polls: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            status_poll_interval_ms: 2000,
            convergence_poll_interval_ms: 3000,
            retry: RetryPolicy::default(),
            start_buffer_secs: 10,
            max_wait_secs: None,
            confirm_poll_interval_ms: 500,
            confirm_max_polls: 60,
        }
    }
}

impl CoordinatorConfig {
    /// Reject settings the program or the protocol cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.status_poll_interval_ms == 0 {
            return Err(ConfigError::Zero("status_poll_interval_ms"));
        }
        if self.convergence_poll_interval_ms == 0 {
            return Err(ConfigError::Zero("convergence_poll_interval_ms"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Zero("retry.max_attempts"));
        }
        if self.confirm_max_polls == 0 {
            return Err(ConfigError::Zero("confirm_max_polls"));
        }
        // the program refuses start timestamps too far in the future
        if !(0..=MAX_START_LEAD_SECS).contains(&self.start_buffer_secs) {
            return Err(ConfigError::StartBuffer {
                got: self.start_buffer_secs,
                max: MAX_START_LEAD_SECS,
            });
        }
        Ok(())
    }

    /// Lobby status poll period
    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    /// Convergence backstop poll period
    pub fn convergence_poll_interval(&self) -> Duration {
        Duration::from_millis(self.convergence_poll_interval_ms)
    }

    /// Signature status and record visibility poll period
    pub fn confirm_poll_interval(&self) -> Duration {
        Duration::from_millis(self.confirm_poll_interval_ms)
    }

    /// Caller deadline for the whole session, if any
    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.convergence_poll_interval(), Duration::from_secs(3));
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.max_wait(), None);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"start_buffer_secs": 5, "retry": {"backoff": "exponential"}}"#)
                .unwrap();
        assert_eq!(config.start_buffer_secs, 5);
        assert_eq!(config.retry.cooldown_ms, 2500);
        assert_eq!(config.retry.backoff, crate::retry::Backoff::Exponential);
    }

    #[test]
    fn test_start_buffer_bounded() {
        let config = CoordinatorConfig {
            start_buffer_secs: 90,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::StartBuffer { got: 90, max: 60 })
        );
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = CoordinatorConfig {
            convergence_poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
