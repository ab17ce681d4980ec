//! Retry policy for HTTP calls.
//!
//! Three primitives make up the whole policy surface: [`RetryPolicy::should_retry`],
//! [`RetryPolicy::retry_delay`] and the [`retry_request`] loop that applies
//! them. Retries are owned by the domain-service layer; the query cache
//! calls services and never retries on its own.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::RequestError;

/// Exponential backoff with jitter.
///
/// `max_retries` bounds the total number of attempts of one logical request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound (exclusive) of the random jitter added to each delay.
    /// Keep it `<= base_delay` so successive delays never decrease.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self {
            max_retries: 1,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether a request that has failed `attempt_count` times with `error`
    /// should be attempted again.
    ///
    /// Client errors (4xx) are final except 408 and 429. Network failures and
    /// 5xx are retried while `attempt_count < max_retries`. Local encode and
    /// decode failures are never retried.
    pub fn should_retry(&self, attempt_count: u32, error: &RequestError) -> bool {
        let retryable = match error {
            RequestError::Network { .. } => true,
            RequestError::Http { status, .. } => match *status {
                408 | 429 => true,
                400..=499 => false,
                _ => true,
            },
            RequestError::Decode { .. } | RequestError::Serialize { .. } => false,
        };
        retryable && attempt_count < self.max_retries
    }

    /// Delay before retry number `attempt_index` (zero-based):
    /// `base * 2^attempt + jitter`, capped at `max_delay`.
    pub fn retry_delay(&self, attempt_index: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..jitter_ms)
        };
        self.backoff_delay(attempt_index, jitter)
    }

    /// Deterministic part of [`RetryPolicy::retry_delay`] with an explicit
    /// jitter in milliseconds.
    pub fn backoff_delay(&self, attempt_index: u32, jitter_ms: u64) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let factor = 1u64.checked_shl(attempt_index).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(factor).saturating_add(jitter_ms);
        Duration::from_millis(delay_ms).min(self.max_delay)
    }
}

/// Run `operation` until it succeeds or `policy` says stop.
///
/// The operation is invoked at most `policy.max_retries` times. Between
/// attempts the task sleeps for [`RetryPolicy::retry_delay`].
pub async fn retry_request<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, RequestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RequestError>>,
{
    let mut attempts: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempts += 1;
                if !policy.should_retry(attempts, &err) {
                    return Err(err);
                }
                let delay = policy.retry_delay(attempts - 1);
                warn!(
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying request"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_no_retry_on_not_found() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(0, &RequestError::http(404, "missing")));
        assert!(!policy.should_retry(0, &RequestError::http(400, "bad")));
        assert!(!policy.should_retry(0, &RequestError::http(401, "expired")));
    }

    #[test]
    fn test_retry_on_timeout_and_rate_limit() {
        let policy = RetryPolicy::default();
        for status in [408u16, 429] {
            let err = RequestError::http(status, "later");
            assert!(policy.should_retry(0, &err));
            assert!(policy.should_retry(2, &err));
            assert!(!policy.should_retry(3, &err));
        }
    }

    #[test]
    fn test_retry_on_network_and_server_errors() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1, &RequestError::network("reset")));
        assert!(policy.should_retry(1, &RequestError::http(502, "bad gateway")));
        assert!(!policy.should_retry(3, &RequestError::network("reset")));
    }

    #[test]
    fn test_no_retry_on_decode() {
        let policy = RetryPolicy::default();
        let err = RequestError::Decode {
            message: "eof".to_string(),
        };
        assert!(!policy.should_retry(0, &err));
    }

    #[test]
    fn test_backoff_delay_exponential_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(0, 0), Duration::from_millis(1000));
        assert_eq!(policy.backoff_delay(1, 0), Duration::from_millis(2000));
        assert_eq!(policy.backoff_delay(2, 250), Duration::from_millis(4250));
        assert_eq!(policy.backoff_delay(5, 0), Duration::from_millis(30_000));
        assert_eq!(policy.backoff_delay(90, 999), Duration::from_millis(30_000));
    }

    #[test]
    fn test_retry_delay_within_jitter_window() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let delay = policy.retry_delay(1);
            assert!(delay >= Duration::from_millis(2000));
            assert!(delay < Duration::from_millis(3000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_request_stops_at_max_retries() {
        let policy = RetryPolicy::default();
        let calls = Cell::new(0u32);
        let started = tokio::time::Instant::now();

        let result: Result<(), _> = retry_request(&policy, || {
            calls.set(calls.get() + 1);
            async { Err(RequestError::network("connection refused")) }
        })
        .await;

        assert!(matches!(result, Err(RequestError::Network { .. })));
        assert_eq!(calls.get(), 3);
        // two sleeps: >= 1000ms and >= 2000ms
        assert!(started.elapsed() >= Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_request_single_attempt_on_client_error() {
        let policy = RetryPolicy::default();
        let calls = Cell::new(0u32);

        let result: Result<(), _> = retry_request(&policy, || {
            calls.set(calls.get() + 1);
            async { Err(RequestError::http(404, "Note not found")) }
        })
        .await;

        assert_eq!(result.unwrap_err().status(), Some(404));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_request_recovers() {
        let policy = RetryPolicy::default();
        let calls = Cell::new(0u32);

        let result = retry_request(&policy, || {
            let n = calls.get() + 1;
            calls.set(n);
            async move {
                if n < 2 {
                    Err(RequestError::http(503, "unavailable"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.get(), 2);
    }
}
