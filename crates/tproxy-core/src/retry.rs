use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tproxy_common::RetryConfig;
use tracing::info;

/// Errors that may be retried transparently because nothing has reached the
/// client yet.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: if config.enabled {
                config.max_attempts.max(1)
            } else {
                1
            },
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// `base × 2^retry` plus up to a quarter of `base` in jitter, capped.
    /// `retry` counts from 1 for the first retry.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let backoff = base_ms.saturating_mul(1u64 << retry.min(16));
        let jitter = rand::random::<u64>() % (base_ms / 4 + 1);
        Duration::from_millis(backoff.saturating_add(jitter)).min(self.max_delay)
    }
}

/// Runs `attempt` until it succeeds, fails with a non-retryable error, the
/// attempt budget runs out or shutdown interrupts the backoff sleep.
///
/// Returns the last result together with the number of attempts made.
pub async fn run_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    shutdown: &mut watch::Receiver<bool>,
    mut attempt: F,
) -> (Result<T, E>, u32)
where
    E: Retryable + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt_no = 1;
    loop {
        let result = attempt(attempt_no).await;
        let err = match result {
            Ok(value) => return (Ok(value), attempt_no),
            Err(err) => err,
        };
        if !err.is_retryable() || attempt_no >= policy.max_attempts || *shutdown.borrow() {
            return (Err(err), attempt_no);
        }

        let delay = policy.backoff_delay(attempt_no);
        info!(
            event = "retry_scheduled",
            attempt = attempt_no,
            delay_ms = delay.as_millis() as u64,
            error = %err
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.wait_for(|stopping| *stopping) => return (Err(err), attempt_no),
        }
        attempt_no += 1;
    }
}
