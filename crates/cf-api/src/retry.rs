// Bounded backoff for Cloud Controller requests.
//
// A poll or log-stream connect that fails transiently is replayed a few
// times before the watcher sees the error. The backoff sleep is raced against
// the watch's cancellation token.

use rand::RngExt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::ApiError;

/// How many times, and how far apart, a platform request is replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Replays after the first request.
    pub max_retries: u32,
    /// Delay before the first replay; doubles on each following one.
    pub base_delay: Duration,
    /// Upper bound for any single delay, jitter included.
    pub max_delay: Duration,
    /// Spread replays of concurrent callers by up to half of `base_delay`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Same delay before every replay.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            jitter: false,
        }
    }

    /// Policy that never replays.
    pub fn none() -> Self {
        Self::fixed(0, Duration::ZERO)
    }

    /// Delay before replay number `retry + 1`.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let doubled = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max_delay);

        if !self.jitter {
            return doubled;
        }

        let headroom = self.max_delay.saturating_sub(doubled).min(self.base_delay / 2);
        let headroom_ms = u64::try_from(headroom.as_millis()).unwrap_or(u64::MAX);
        if headroom_ms == 0 {
            return doubled;
        }
        doubled + Duration::from_millis(rand::rng().random_range(0..headroom_ms))
    }
}

/// Outcome of one request, as seen by [`retry_with_backoff`].
pub enum RetryAction<T> {
    Success(T),
    /// Worth replaying: network failure, 5xx, 429.
    Retry(ApiError),
    /// Returned to the caller as is.
    Fail(ApiError),
}

impl<T> RetryAction<T> {
    /// Sort a request result by [`ApiError::is_transient`].
    pub fn classify(result: Result<T, ApiError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(e) if e.is_transient() => Self::Retry(e),
            Err(e) => Self::Fail(e),
        }
    }
}

/// Run `request` until it succeeds, fails permanently, or the policy runs out.
///
/// `request` receives the zero-based attempt number. Once the replays are
/// spent the last transient error is returned unchanged, so callers can still
/// tell a flaky platform from a broken one.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    request: F,
) -> Result<T, ApiError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(ApiError::Cancelled);
        }

        let err = match request(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) if attempt >= policy.max_retries => return Err(err),
            RetryAction::Retry(err) => err,
        };

        let delay = policy.delay_for_attempt(attempt);
        attempt += 1;
        warn!(
            retry = attempt,
            of = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Platform request failed, retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ApiError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
