//! Retry policy with exponential backoff.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// How failed requests are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub retry_delay: Duration,
    /// Double the delay after every failed retry.
    pub backoff: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            backoff: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if !self.backoff {
            return self.retry_delay;
        }
        let exp = attempt.saturating_sub(1).min(16);
        self.retry_delay.saturating_mul(1u32 << exp)
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Waits between attempts. Swappable so tests can record delays.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// [`Sleeper`] backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Last error of an operation that ran out of attempts.
#[derive(Debug)]
pub struct RetryError<E> {
    pub attempts: u32,
    pub error: E,
}

/// Runs `op` until it succeeds, fails with a non-retryable error or
/// exhausts `policy`.
///
/// `op` receives the 1-based attempt number. `on_retry` fires before every
/// wait with the failed attempt, its error and the upcoming delay.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    is_retryable: impl Fn(&E) -> bool,
    mut on_retry: impl FnMut(u32, &E, Duration),
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= policy.max_attempts() || !is_retryable(&error) {
                    return Err(RetryError {
                        attempts: attempt,
                        error,
                    });
                }
                let delay = policy.delay_for_attempt(attempt);
                on_retry(attempt, &error, delay);
                sleeper.sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records requested delays and returns immediately.
    #[derive(Default)]
    pub(crate) struct RecordingSleeper {
        pub(crate) delays: Mutex<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            self.delays.lock().unwrap().push(duration);
            Box::pin(async {})
        }
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn constant_delay_without_backoff() {
        let policy = RetryPolicy {
            backoff: false,
            retry_delay: Duration::from_millis(250),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(250));
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_for_attempt(u32::MAX) >= policy.delay_for_attempt(17));
    }

    #[tokio::test]
    async fn succeeds_after_two_failures() {
        let sleeper = RecordingSleeper::default();
        let mut notified = Vec::new();

        let result = retry(
            &RetryPolicy::default(),
            &sleeper,
            |_: &&str| true,
            |attempt, _, delay| notified.push((attempt, delay)),
            |attempt| async move {
                if attempt < 3 { Err("flaky") } else { Ok(attempt) }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(
            *sleeper.delays.lock().unwrap(),
            vec![Duration::from_millis(1000), Duration::from_millis(2000)]
        );
        assert_eq!(
            notified,
            vec![
                (1, Duration::from_millis(1000)),
                (2, Duration::from_millis(2000))
            ]
        );
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let sleeper = RecordingSleeper::default();
        let err = retry(
            &RetryPolicy::default(),
            &sleeper,
            |_: &&str| true,
            |_, _, _| {},
            |_| async { Err::<(), _>("down") },
        )
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 4);
        assert_eq!(err.error, "down");
        assert_eq!(sleeper.delays.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let sleeper = RecordingSleeper::default();
        let err = retry(
            &RetryPolicy::default(),
            &sleeper,
            |e: &&str| *e != "fatal",
            |_, _, _| {},
            |_| async { Err::<(), _>("fatal") },
        )
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 1);
        assert!(sleeper.delays.lock().unwrap().is_empty());
    }
}
