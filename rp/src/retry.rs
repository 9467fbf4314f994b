//! Cancellable exponential backoff

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::RunError;
use crate::run::abortable_sleep;

/// Backoff parameters for [`retry`]
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one
    pub retries: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Add up to 20% random extra delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            min_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt + 1` (attempt is zero-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let raw = self.min_delay.as_millis() as f64 * self.factor.powi(attempt as i32);
        let capped = raw.min(self.max_delay.as_millis() as f64);
        let jitter = if self.jitter {
            rand::random::<f64>() * 0.2 * capped
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).round() as u64)
    }

    /// Backoff, stretched to honour a server-provided retry-after (still capped)
    fn delay_for(&self, attempt: u32, error: &RunError) -> Duration {
        let backoff = self.backoff(attempt);
        match error.retry_after() {
            Some(after) => backoff.max(after.min(self.max_delay)),
            None => backoff,
        }
    }
}

/// Details handed to the retry observer before each wait
#[derive(Debug)]
pub struct RetryNotice<'a> {
    /// One-based number of the retry about to happen
    pub attempt: u32,
    pub delay: Duration,
    pub error: &'a RunError,
}

/// Run `op` until it succeeds, fails with a non-retryable error, exhausts
/// `policy.retries`, or `cancel` fires.
///
/// Cancellation is checked before every attempt and interrupts the backoff
/// wait; both surface as [`RunError::Aborted`].
pub async fn retry<T, F, Fut, N>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut on_retry: N,
    mut op: F,
) -> Result<T, RunError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RunError>>,
    N: FnMut(&RetryNotice<'_>),
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(RunError::Aborted("cancelled before attempt".to_string()));
        }

        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !error.is_retryable() || attempt >= policy.retries {
            debug!(attempt, error = %error, retryable = error.is_retryable(), "retry: giving up");
            return Err(error);
        }

        let delay = policy.delay_for(attempt, &error);
        warn!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %error, "retry: transient failure, backing off");
        on_retry(&RetryNotice {
            attempt: attempt + 1,
            delay,
            error: &error,
        });
        abortable_sleep(cancel, delay).await?;
        attempt += 1;
    }
}
