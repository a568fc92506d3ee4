use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::warn;

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    None,
    Fixed(Duration),
    Exponential {
        base: Duration,
        max: Duration,
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            base: Duration::from_millis(250),
            max: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max, jitter } => {
                let base_ms = base.as_millis().min(u128::from(u64::MAX)) as u64;
                let max_ms = max.as_millis().min(u128::from(u64::MAX)) as u64;
                let exp = base_ms.saturating_mul(1u64 << attempt.min(16)).min(max_ms);
                let delay_ms = if jitter { rng.gen_range(0..=exp) } else { exp };
                Duration::from_millis(delay_ms)
            }
        }
    }
}

/// Retry ceiling, per-call timeout and delay strategy for collaborator I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub timeout: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(30),
            backoff: Backoff::default(),
        }
    }
}

/// Errors that can tell whether another attempt may succeed.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for wasync_core::OAuthError {
    fn is_transient(&self) -> bool {
        self.is_retryable()
    }
}

#[derive(Debug)]
pub enum LastFailure<E> {
    Error(E),
    TimedOut(Duration),
}

impl<E: fmt::Display> fmt::Display for LastFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LastFailure::Error(err) => err.fmt(f),
            LastFailure::TimedOut(after) => write!(f, "timed out after {after:?}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E: fmt::Display + fmt::Debug> {
    #[error("{0}")]
    Fatal(E),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: LastFailure<E> },
}

/// Runs `op` with a timeout per attempt, retrying transient failures and
/// timeouts up to `policy.max_retries` times.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Retryable + fmt::Display + fmt::Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        let failure = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) if !err.is_transient() => return Err(RetryError::Fatal(err)),
            Ok(Err(err)) => LastFailure::Error(err),
            Err(_) => LastFailure::TimedOut(policy.timeout),
        };
        if attempt >= policy.max_retries {
            return Err(RetryError::Exhausted {
                attempts: attempt + 1,
                last: failure,
            });
        }
        let delay = policy.backoff.delay(attempt);
        warn!(
            operation = label,
            attempt = attempt + 1,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            "transient failure: {failure}"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Error)]
    enum FakeError {
        #[error("flaky")]
        Flaky,
        #[error("broken")]
        Broken,
    }

    impl Retryable for FakeError {
        fn is_transient(&self) -> bool {
            matches!(self, FakeError::Flaky)
        }
    }

    fn quick(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            timeout: Duration::from_millis(200),
            backoff: Backoff::None,
        }
    }

    #[test]
    fn exponential_backoff_without_jitter_doubles_until_cap() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(800),
            jitter: false,
        };
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<_> = (0..5)
            .map(|attempt| backoff.delay_with_rng(attempt, &mut rng).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 800]);
    }

    #[test]
    fn jittered_backoff_stays_under_cap() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(800),
            jitter: true,
        };
        let mut rng = StdRng::seed_from_u64(42);
        assert!(backoff.delay_with_rng(3, &mut rng) <= Duration::from_millis(800));
        assert_eq!(
            Backoff::Fixed(Duration::from_millis(5)).delay_with_rng(9, &mut rng),
            Duration::from_millis(5)
        );
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = with_retry(&quick(3), "test", || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(FakeError::Flaky)
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = with_retry(&quick(5), "test", || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(FakeError::Broken)
        })
        .await;
        assert!(matches!(result, Err(RetryError::Fatal(FakeError::Broken))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = with_retry(&quick(2), "test", || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(FakeError::Flaky)
        })
        .await;
        assert!(matches!(
            result,
            Err(RetryError::Exhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn timeouts_count_as_transient() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy {
            max_retries: 1,
            timeout: Duration::from_millis(20),
            backoff: Backoff::None,
        };
        let result: Result<(), RetryError<FakeError>> = with_retry(&policy, "test", || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(
            result,
            Err(RetryError::Exhausted {
                attempts: 2,
                last: LastFailure::TimedOut(_)
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
