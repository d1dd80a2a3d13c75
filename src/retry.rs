//! Retrying of transient failures.

use rand::Rng;
use std::{future::Future, time::Duration};
use tokio::time::sleep;
use tracing::warn;

use crate::error::{ApiError, AuthFetchError};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_BASE: f64 = 2.0;
const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);
const DEFAULT_MAX_JITTER: Duration = Duration::from_secs(1);

/// How transient failures are retried.
///
/// The delay before retry `n` (starting at 1) is `backoff_unit * backoff_base^n` plus a uniformly random jitter in
/// `[0, max_jitter)`. With the defaults that's roughly 2s, 4s and 8s for up to 4 attempts in total.
///
/// A policy is an immutable value owned by whoever makes the calls, there's no process wide retry state.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Whether failed calls are retried at all.
    pub enabled: bool,

    /// The number of retries after the first attempt.
    pub max_retries: u32,

    /// The base of the exponential backoff.
    pub backoff_base: f64,

    /// The unit the exponential backoff is multiplied by.
    pub backoff_unit: Duration,

    /// The upper bound of the random jitter added to each delay.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_unit: DEFAULT_BACKOFF_UNIT,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self { enabled: false, ..Default::default() }
    }

    /// Set the number of retries after the first attempt.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the unit and jitter of the backoff.
    pub fn with_backoff(mut self, backoff_unit: Duration, max_jitter: Duration) -> Self {
        self.backoff_unit = backoff_unit;
        self.max_jitter = max_jitter;
        self
    }

    /// The total number of attempts a call may get.
    pub fn max_attempts(&self) -> u32 {
        if self.enabled {
            self.max_retries.saturating_add(1)
        } else {
            1
        }
    }

    /// The delay before the given retry, excluding jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let factor = self.backoff_base.powi(exponent);
        Duration::try_from_secs_f64(self.backoff_unit.as_secs_f64() * factor).unwrap_or(Duration::MAX)
    }

    /// The delay before the given retry, including jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let jitter = if self.max_jitter.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..self.max_jitter)
        };
        self.base_delay(retry).saturating_add(jitter)
    }

    /// Run an operation, retrying it while it fails with a transient error.
    ///
    /// Non transient errors are returned on the spot. Once all attempts are used up the last error is returned.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < max_attempts && is_retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    warn!("Attempt {attempt}/{max_attempts} failed, retrying in {delay:?}: {e}");
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Whether an error is transient and the call that caused it is worth retrying.
pub fn is_retryable(error: &ApiError) -> bool {
    match error {
        ApiError::RequestTimeout(_)
        | ApiError::ServiceUnavailable(_)
        | ApiError::Connection(_)
        | ApiError::Transport(_) => true,
        ApiError::Auth(AuthFetchError::Http(e)) => e.is_connect() || e.is_timeout() || e.is_request(),
        ApiError::Auth(AuthFetchError::Rejected { status, .. }) => *status == 408 || *status >= 500,
        _ => false,
    }
}
