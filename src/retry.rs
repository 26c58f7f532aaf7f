//! Bounded backoff and timeouts for outbound calls (payment gateway, email).

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    /// 3 attempts, waiting 1s then 2s between them.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, retry_count: u32) -> Duration {
        self.base_delay * (1u32 << retry_count.min(16))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are exhausted. Only `AppError::is_retryable` errors
/// (5xx, network, timeout) are retried.
pub async fn with_retry<T, F, Fut>(operation: &str, policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry_count = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retryable() || retry_count + 1 >= policy.max_attempts {
                    return Err(err);
                }
                let delay = policy.delay_for(retry_count);
                tracing::warn!(
                    operation,
                    attempt = retry_count + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure, retrying"
                );
                sleep(delay).await;
                retry_count += 1;
            }
        }
    }
}

/// Run `fut` with an upper bound on its duration.
pub async fn with_timeout<T, Fut>(operation: &str, limit: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, limit_ms = limit.as_millis() as u64, "Operation timed out");
            Err(AppError::Timeout(operation.to_string()))
        }
    }
}
