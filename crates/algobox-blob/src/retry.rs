//! Bounded retry for storage writes.
//!
//! Only errors classified as transient by [`BlobError::is_transient`] are
//! retried. The delay grows exponentially from `base_delay`, is capped at
//! `max_delay`, and gets a random jitter of up to `jitter` added.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::BlobError;

/// Retry policy for storage operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total number of attempts, including the first one.
  pub attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
  pub jitter: Duration,
}

impl RetryPolicy {
  /// A policy that never retries.
  pub fn none() -> Self {
    Self {
      attempts: 1,
      base_delay: Duration::ZERO,
      max_delay: Duration::ZERO,
      jitter: Duration::ZERO,
    }
  }

  /// Delay before the attempt following `attempt` (zero-based).
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let exp = self
      .base_delay
      .saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let capped = exp.min(self.max_delay);
    let jitter_ms = self.jitter.as_millis() as u64;
    let jitter = if jitter_ms == 0 {
      0
    } else {
      rand::rng().random_range(0..=jitter_ms)
    };
    capped + Duration::from_millis(jitter)
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      attempts: 8,
      base_delay: Duration::from_millis(100),
      max_delay: Duration::from_secs(2),
      jitter: Duration::from_millis(200),
    }
  }
}

/// Run `op` until it succeeds, fails permanently, or the attempts are exhausted.
pub async fn with_retry<T, F, Fut>(
  policy: &RetryPolicy,
  operation: &str,
  mut op: F,
) -> Result<T, BlobError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, BlobError>>,
{
  let attempts = policy.attempts.max(1);
  let mut attempt = 0;

  loop {
    match op().await {
      Ok(value) => return Ok(value),
      Err(e) if e.is_transient() && attempt + 1 < attempts => {
        let delay = policy.delay_for(attempt);
        warn!(
          operation = operation,
          attempt = attempt + 1,
          attempts = attempts,
          delay_ms = delay.as_millis() as u64,
          error = %e,
          "storage operation failed, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
      Err(e) => return Err(e),
    }
  }
}
