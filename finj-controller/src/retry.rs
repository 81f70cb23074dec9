//! Reconnection retry loop.
//!
//! After a host is lost the controller tries to reach it again every
//! `RETRY_PERIOD` until `RETRY_INTERVAL` has elapsed since the loss. Attempt
//! times are anchored to the moment of loss, so a slow attempt eats into the
//! window instead of extending it.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use finj_common::FinjConfig;

/// Errors that can be retried.
pub trait RetryableError {
    /// Whether another attempt could succeed.
    fn is_retryable(&self) -> bool;
}

/// Fixed-period reconnection schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Total window after a loss; zero disables retrying.
    pub interval: Duration,
    /// Gap between attempts.
    pub period: Duration,
}

impl ReconnectPolicy {
    pub fn new(interval: Duration, period: Duration) -> Self {
        Self { interval, period }
    }

    pub fn from_config(config: &FinjConfig) -> Self {
        Self::new(config.retry_interval(), config.retry_period())
    }

    /// `ceil(interval / period)`, or 0 when retrying is disabled.
    pub fn max_attempts(&self) -> u32 {
        if self.interval.is_zero() {
            return 0;
        }
        let period = self.period.as_millis();
        if period == 0 {
            return 1;
        }
        let attempts = self.interval.as_millis().div_ceil(period);
        u32::try_from(attempts).unwrap_or(u32::MAX)
    }

    /// Offset from the loss at which attempt `attempt` (1-based) starts.
    pub fn attempt_offset(&self, attempt: u32) -> Duration {
        self.period.saturating_mul(attempt).min(self.interval)
    }
}

/// Why a retry loop gave up.
#[derive(Debug)]
pub enum RetryFailure<E> {
    /// Every attempt in the window failed; `last` is `None` when no attempt
    /// was made.
    Exhausted { attempts: u32, last: Option<E> },
    /// An attempt failed with an error that retrying cannot fix.
    Fatal { attempt: u32, error: E },
}

impl<E: std::fmt::Display> std::fmt::Display for RetryFailure<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryFailure::Exhausted {
                attempts,
                last: Some(error),
            } => write!(f, "gave up after {attempts} attempt(s): {error}"),
            RetryFailure::Exhausted { attempts, last: None } => {
                write!(f, "gave up after {attempts} attempt(s)")
            }
            RetryFailure::Fatal { attempt, error } => {
                write!(f, "attempt {attempt} failed permanently: {error}")
            }
        }
    }
}

/// Run `op` on the policy's schedule, counting from `since`, until it
/// succeeds, fails fatally or the window closes.
pub async fn run_with_retry<F, Fut, T, E>(
    host: &str,
    policy: &ReconnectPolicy,
    since: Instant,
    mut op: F,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let max_attempts = policy.max_attempts();
    let mut last = None;

    for attempt in 1..=max_attempts {
        sleep_until(since + policy.attempt_offset(attempt)).await;
        debug!(host, attempt, max_attempts, "Reconnection attempt");

        match op().await {
            Ok(value) => {
                info!(host, attempt, "Reconnected");
                return Ok(value);
            }
            Err(error) if error.is_retryable() => {
                warn!(host, attempt, %error, "Reconnection attempt failed");
                last = Some(error);
            }
            Err(error) => {
                warn!(host, attempt, %error, "Reconnection failed (non-retryable)");
                return Err(RetryFailure::Fatal { attempt, error });
            }
        }
    }

    Err(RetryFailure::Exhausted {
        attempts: max_attempts,
        last,
    })
}
