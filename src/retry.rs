//! Bounded retry for idempotent reads.

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::debug;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Growth rule for the delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Constant(Duration),
    /// The wait before retry `n` (1-based) is `base * factor^(n-1)`, capped
    /// at `max`.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
    },
}

impl Backoff {
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Constant(delay) => delay,
            Backoff::Exponential { base, factor, max } => {
                let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
                let scaled = base.as_nanos() as f64 * factor.max(0.0).powi(exponent);
                if !scaled.is_finite() || scaled >= max.as_nanos() as f64 {
                    max
                } else {
                    Duration::from_nanos(scaled.round() as u64)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// `factor == 1` keeps a constant delay; any other factor grows the
    /// delay exponentially from `DEFAULT_BASE_DELAY`.
    pub fn new(retries: u32, factor: f64) -> Self {
        Self::with_base_delay(retries, factor, DEFAULT_BASE_DELAY)
    }

    pub fn with_base_delay(retries: u32, factor: f64, base: Duration) -> Self {
        let backoff = if factor == 1.0 {
            Backoff::Constant(base)
        } else {
            Backoff::Exponential {
                base,
                factor,
                max: DEFAULT_MAX_DELAY,
            }
        };
        Self { retries, backoff }
    }

    pub fn constant(retries: u32, delay: Duration) -> Self {
        Self {
            retries,
            backoff: Backoff::Constant(delay),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 1.0)
    }
}

/// Index of the current call, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub number: u32,
    pub max: u32,
}

impl Attempt {
    pub fn is_last(&self) -> bool {
        self.number >= self.max
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    Exhausted { attempts: u32, last: E },
    /// The operation failed with an error the caller marked as not safe to
    /// retry.
    Aborted { attempt: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Aborted { attempt, .. } => *attempt,
        }
    }

    pub fn last_error(&self) -> &E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Aborted { error, .. } => error,
        }
    }

    pub fn into_last_error(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Aborted { error, .. } => error,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted { attempts, last } => {
                write!(f, "gave up after {} attempt(s): {}", attempts, last)
            }
            RetryError::Aborted { attempt, error } => {
                write!(f, "not retrying after attempt {}: {}", attempt, error)
            }
        }
    }
}

impl<E> Error for RetryError<E>
where
    E: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.last_error())
    }
}

/// Calls `operation` up to `policy.retries + 1` times, returning the first
/// success.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, RetryError<E>>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    retry_if(policy, operation, |_| true).await
}

/// Like `retry`, but stops with `RetryError::Aborted` as soon as
/// `should_retry` rejects an error.
pub async fn retry_if<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: R,
) -> Result<T, RetryError<E>>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: fmt::Display,
{
    let max = policy.max_attempts();
    let mut number = 1;
    loop {
        let attempt = Attempt { number, max };
        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if !should_retry(&error) {
            debug!(attempt = number, error = %error, "attempt failed, not retryable");
            return Err(RetryError::Aborted {
                attempt: number,
                error,
            });
        }
        if attempt.is_last() {
            debug!(attempts = number, error = %error, "retries exhausted");
            return Err(RetryError::Exhausted {
                attempts: number,
                last: error,
            });
        }
        let delay = policy.backoff.delay_before_retry(number);
        debug!(attempt = number, ?delay, error = %error, "attempt failed, retrying");
        tokio::time::sleep(delay).await;
        number += 1;
    }
}
