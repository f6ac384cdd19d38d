use std::fmt;
use std::future::Future;
use std::time;

use tracing::warn;

/// The outcome of a single attempt at a retryable operation.
#[derive(Debug)]
pub enum Attempt<T, E> {
    /// The operation succeeded, stop retrying.
    Success(T),
    /// The operation failed but trying again could resolve the issue.
    Retryable(E),
    /// The operation failed and trying again will not help.
    Fatal(E),
}

#[derive(Copy, Clone, Debug)]
/// The retry policy used to bound and space out calls to the key service.
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    max_attempts: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_multiplier: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_interval: time::Duration, backoff_multiplier: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval,
            backoff_multiplier,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Calculate the time to wait after the attempt with the given zero-based index failed.
    ///
    /// The growth is `initial_interval * attempt * backoff_multiplier`, not exponential.
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        if attempt == 0 {
            self.initial_interval
        } else {
            self.initial_interval
                .saturating_mul(attempt.saturating_mul(self.backoff_multiplier))
        }
    }

    /// Drive `operation` until it succeeds, fails fatally, or `max_attempts` is exhausted.
    /// On exhaustion the error from the last attempt is returned.
    ///
    /// # Arguments
    ///
    /// * `operation`: A name for the operation, used in logs and metrics.
    /// * `attempt`: A closure producing a future for one attempt.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T, E>
    where
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Attempt<T, E>>,
    {
        let mut attempts: u32 = 0;

        loop {
            match attempt().await {
                Attempt::Success(value) => return Ok(value),
                Attempt::Fatal(error) => return Err(error),
                Attempt::Retryable(error) => {
                    let delay = self.time_until_next_retry(attempts);
                    attempts += 1;

                    if attempts >= self.max_attempts {
                        warn!(
                            operation,
                            attempt_number = attempts,
                            max_attempts = self.max_attempts,
                            error_message = %error,
                            "giving up after exhausting all attempts"
                        );
                        return Err(error);
                    }

                    warn!(
                        operation,
                        attempt_number = attempts,
                        max_attempts = self.max_attempts,
                        retry_delay_ms = delay.as_millis() as u64,
                        error_message = %error,
                        "attempt failed, retrying"
                    );
                    metrics::counter!("key_service_retries_total", "operation" => operation.to_owned())
                        .increment(1);

                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: time::Duration::from_secs(1),
            backoff_multiplier: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, time::Duration::from_millis(1), 1)
    }

    #[test]
    fn test_time_until_next_retry() {
        let policy = RetryPolicy::new(5, time::Duration::from_millis(100), 3);

        assert_eq!(policy.time_until_next_retry(0), time::Duration::from_millis(100));
        assert_eq!(policy.time_until_next_retry(1), time::Duration::from_millis(300));
        assert_eq!(policy.time_until_next_retry(2), time::Duration::from_millis(600));
        assert_eq!(policy.time_until_next_retry(4), time::Duration::from_millis(1200));
    }

    #[test]
    fn test_zero_max_attempts_still_tries_once() {
        let policy = RetryPolicy::new(0, time::Duration::from_millis(1), 1);

        assert_eq!(policy.max_attempts(), 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_two_failures() {
        let calls = AtomicU32::new(0);

        let result: Result<&str, String> = fast_policy(5)
            .run("test", || async {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call < 3 {
                    Attempt::Retryable(format!("failure {}", call))
                } else {
                    Attempt::Success("done")
                }
            })
            .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_the_attempt_that_failed() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, time::Duration::from_millis(100), 3);
        let start = tokio::time::Instant::now();

        let result: Result<&str, String> = policy
            .run("test", || async {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call < 3 {
                    Attempt::Retryable(format!("failure {}", call))
                } else {
                    Attempt::Success("done")
                }
            })
            .await;

        // 100ms after the first attempt, then 100ms * 1 * 3 after the second.
        let elapsed = start.elapsed();
        assert_eq!(result, Ok("done"));
        assert!(elapsed >= time::Duration::from_millis(400), "{:?}", elapsed);
        assert!(elapsed < time::Duration::from_millis(410), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn test_returns_last_error_when_exhausted() {
        let calls = AtomicU32::new(0);

        let result: Result<(), String> = fast_policy(4)
            .run("test", || async {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Attempt::Retryable(format!("failure {}", call))
            })
            .await;

        assert_eq!(result, Err("failure 4".to_owned()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);

        let result: Result<(), String> = fast_policy(4)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Attempt::Fatal("bad request".to_owned())
            })
            .await;

        assert_eq!(result, Err("bad request".to_owned()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
