//! Retry with exponential backoff
//!
//! Only transport-class failures are retried. Reverts and validation errors
//! are deterministic and surface on the first attempt.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Policy without delays, for tests and simulations
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before the attempt following `failures` consecutive failures
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 1u64 << failures.saturating_sub(1).min(5);
        Duration::from_millis(
            self.base_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && failures + 1 < self.max_attempts.max(1) => {
                    failures += 1;
                    let delay = self.delay(failures);
                    warn!(
                        what,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after error: {}",
                        e
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
