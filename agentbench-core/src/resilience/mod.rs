// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Resilience primitives (retry policy + request-rate governor).

mod rate_limit;

pub use rate_limit::{RateLimiter, TokenBucketLimiter, UnlimitedRateLimiter};

use rand::random;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Error classes that must fail fast instead of being retried
pub const NON_RETRYABLE_MARKERS: &[&str] = &[
    "validation",
    "authentication",
    "authorization",
    "unauthorized",
    "forbidden",
    "not found",
    "notfound",
    "not_found",
    "bad request",
    "badrequest",
    "bad_request",
    "permission",
];

/// Errors that know whether another attempt can help
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Classify a free-form error message against [`NON_RETRYABLE_MARKERS`]
pub fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    !NON_RETRYABLE_MARKERS.iter().any(|m| lower.contains(m))
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// 1s base doubling up to 30s, three retries
    pub fn exponential() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    /// 0.5s base doubling, three retries
    pub fn judge() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::exponential()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let jitter_factor = 1.0 + (random::<f64>() - 0.5) * 2.0 * self.jitter;
        let jittered = (base * jitter_factor).max(0.0);
        let clamped = jittered.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(clamped)
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("Non-retryable failure: {0}")]
    NonRetryable(E),
    #[error("All {attempts} attempts exhausted. Last error: {last_error}")]
    Exhausted { attempts: u32, last_error: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::NonRetryable(e) => e,
            RetryError::Exhausted { last_error, .. } => last_error,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::NonRetryable(_) => 1,
            RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Run `operation` until it succeeds, fails non-retryably, or the policy runs out.
///
/// The closure receives the zero-based attempt number.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(RetryError::NonRetryable(e)),
            Err(e) if attempt >= policy.max_retries => {
                return Err(RetryError::Exhausted {
                    attempts: attempt + 1,
                    last_error: e,
                })
            }
            Err(e) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    "Attempt {}/{} failed: {}; retrying in {:.1}s",
                    attempt + 1,
                    policy.max_retries + 1,
                    e,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError(&'static str);

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.0)
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            is_retryable_message(self.0)
        }
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_message_classification() {
        assert!(!is_retryable_message("AuthenticationError: bad key"));
        assert!(!is_retryable_message("404 Not Found"));
        assert!(is_retryable_message("connection reset by peer"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&RetryPolicy::judge(), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TestError("temporary"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&RetryPolicy::exponential(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError("validation failed")) }
        })
        .await;
        assert!(matches!(result, Err(RetryError::NonRetryable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_reports_attempts() {
        let result: Result<(), _> =
            retry_with_backoff(&RetryPolicy::judge().with_max_retries(2), |_| async {
                Err(TestError("flaky"))
            })
            .await;
        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }
}
