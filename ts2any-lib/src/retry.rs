//! Bounded exponential backoff for sink emission
//!
//! The sink path retries transient failures up to a fixed number of times;
//! anything non-retryable or past the bound propagates to the caller.

use crate::error::Result;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy for sink emission
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 8,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 1.5,
            jitter: true,
        }
    }
}

impl RetryConfig {
    fn to_backoff(&self) -> BoundedBackoff {
        let inner = ExponentialBackoff {
            current_interval: self.initial_delay,
            initial_interval: self.initial_delay,
            randomization_factor: if self.jitter { 0.3 } else { 0.0 },
            multiplier: self.multiplier,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..Default::default()
        };
        BoundedBackoff {
            inner,
            max_retries: self.max_retries,
            remaining: self.max_retries,
        }
    }
}

/// Exponential backoff that stops after a fixed number of retries
struct BoundedBackoff {
    inner: ExponentialBackoff,
    max_retries: u32,
    remaining: u32,
}

impl Backoff for BoundedBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.inner.next_backoff()
    }

    fn reset(&mut self) {
        self.remaining = self.max_retries;
        self.inner.reset();
    }
}

/// Run `operation` under the policy, retrying only retryable errors.
/// The final error propagates once the retry budget is exhausted.
pub async fn retry_bounded<T, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = config.to_backoff();
    backoff.reset();
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => match backoff.next_backoff() {
                Some(delay) => {
                    warn!("Retryable failure, backing off {:?}: {}", delay, err);
                    tokio::time::sleep(delay).await;
                }
                None => return Err(err),
            },
            Err(err) => return Err(err),
        }
    }
}
