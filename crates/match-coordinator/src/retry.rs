//! Bounded retry for transient ledger failures

use ledger_bridge::LedgerError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Errors that may clear up on their own
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for LedgerError {
    fn is_transient(&self) -> bool {
        LedgerError::is_transient(self)
    }
}

/// How the cool-down grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Fixed,
    /// Doubles after each retry
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Wait before the first retry
    pub cooldown_ms: u64,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            cooldown_ms: 2500,
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    /// Cool-down before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = Duration::from_millis(self.cooldown_ms);
        match self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential => base.saturating_mul(1u32 << retry.saturating_sub(1).min(16)),
        }
    }

    /// Run `op` until it succeeds, fails terminally, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. `on_retry` is called with
    /// the failed attempt number and its error before each cool-down.
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        mut op: F,
        mut on_retry: impl FnMut(u32, &E),
    ) -> Result<T, E>
    where
        E: Transient + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        "{} attempt {}/{} failed: {}; retrying in {:?}",
                        label,
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );
                    on_retry(attempt, &e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
