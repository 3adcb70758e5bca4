// Fetch Retry Utility: shared retry-with-backoff logic for manifest and segment requests.
//
// Implements exponential backoff with jitter and a max delay cap. Each transient
// failure is handed to an observer so adapters can surface it as a non-fatal error.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::AdapterError;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not counting the initial attempt).
    pub max_retries: u32,
    /// Base delay between retries. Actual delay = base * 2^attempt + jitter.
    pub base_delay: Duration,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
    /// When true, adds random jitter of [0, base_delay/2).
    pub jitter: bool,
}

impl RetryPolicy {
    /// Policy used for media fragments.
    pub fn fragments() -> Self {
        Self {
            max_retries: 6,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(8),
            jitter: true,
        }
    }

    /// Policy used for manifests and variant playlists.
    pub fn manifests() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: true,
        }
    }

    /// A policy that gives up after the first failure.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Compute the delay for a given attempt number (0-indexed).
    pub(crate) fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // 2^attempt saturates for attempts >= 32.
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exp_delay = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);
        let capped = exp_delay.min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        if jitter_range_ms == 0 {
            return capped;
        }

        // Jitter never pushes the delay past `max_delay`.
        let remaining_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fragments()
    }
}

/// Result of a single attempt, used by the caller to signal retryability.
pub enum RetryAction<T> {
    /// Operation succeeded.
    Success(T),
    /// Operation failed with a retryable error (network, 5xx, timeout).
    Retry(AdapterError),
    /// Operation failed with a non-retryable error (4xx, parse error).
    Fail(AdapterError),
}

impl<T> From<Result<T, AdapterError>> for RetryAction<T> {
    fn from(result: Result<T, AdapterError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(err) if err.is_retryable() => Self::Retry(err),
            Err(err) => Self::Fail(err),
        }
    }
}

/// Execute an async operation with retry-and-backoff.
///
/// The `operation` closure receives the current attempt number (0-indexed).
/// `on_retry` is invoked with every transient failure that will be retried.
pub async fn retry_with_backoff<F, Fut, T, R>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut on_retry: R,
    operation: F,
) -> Result<T, AdapterError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
    R: FnMut(&AdapterError, u32),
{
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(AdapterError::Cancelled);
        }

        let outcome = tokio::select! {
            _ = token.cancelled() => return Err(AdapterError::Cancelled),
            outcome = operation(attempt) => outcome,
        };

        match outcome {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => {
                if attempt >= policy.max_retries {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt = attempt + 1,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after transient error"
                );
                on_retry(&err, attempt + 1);
                tokio::select! {
                    _ = token.cancelled() => return Err(AdapterError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}
