//! Retry logic with fixed or exponential backoff
//!
//! A [`RetryPolicy`] is built once per stage from its [`RetryConfig`] and answers a
//! single question: after attempt `n` failed with error `e`, how long should the caller
//! wait before trying again, if at all? [`run_with_retry`] wraps that answer into a loop
//! for operations that can be expressed as a closure; the analysis lane drives the
//! policy by hand because its collaborator is borrowed mutably across attempts.
//!
//! # Example
//!
//! ```no_run
//! use reelbatch::retry::{IsRetryable, RetryPolicy, run_with_retry};
//! use reelbatch::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{:?}", self)
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let policy = RetryPolicy::new(&RetryConfig::default());
//! let value = run_with_retry(&policy, || async {
//!     // Your operation here
//!     Ok::<_, MyError>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{BackoffPolicy, RetryConfig};
use crate::error::{AcquireError, AcquireErrorKind, AnalyzeError, AnalyzeErrorKind, Error};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network hiccups, rate limits, timeouts) should return `true`.
/// Permanent failures (unsupported content, rejected content, expired session) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for AcquireError {
    fn is_retryable(&self) -> bool {
        !matches!(self.kind, AcquireErrorKind::PermanentUnsupported)
    }
}

impl IsRetryable for AnalyzeError {
    fn is_retryable(&self) -> bool {
        match self.kind {
            AnalyzeErrorKind::RateLimited
            | AnalyzeErrorKind::Timeout
            | AnalyzeErrorKind::EmptyResponse => true,
            // Every later call fails the same way until an operator logs in again
            AnalyzeErrorKind::SessionExpired => false,
            AnalyzeErrorKind::PermanentRejected => false,
        }
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
            ),
            Error::ExternalTool(msg) => {
                msg.contains("timeout") || msg.contains("busy") || msg.contains("temporary")
            }
            _ => false,
        }
    }
}

/// Per-stage retry policy: attempt ceiling plus delay function
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: BackoffPolicy,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl RetryPolicy {
    /// Build a policy from a stage's retry configuration
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: config.backoff,
            initial_delay: config.initial_delay,
            max_delay: config.max_delay,
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }

    /// Retries allowed after the first attempt
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Base delay before retry number `retry` (1-based), without jitter
    pub fn base_delay(&self, retry: u32) -> Duration {
        let delay = match self.backoff {
            BackoffPolicy::Fixed => self.initial_delay,
            BackoffPolicy::Exponential => {
                let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
                let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
                if secs.is_finite() {
                    Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
                } else {
                    self.max_delay
                }
            }
        };
        delay.min(self.max_delay)
    }

    /// Delay to wait after `attempt` (1-based) failed with `error`, or `None` to give up
    pub fn next_delay<E: IsRetryable>(&self, attempt: u32, error: &E) -> Option<Duration> {
        if !error.is_retryable() || attempt > self.max_retries {
            return None;
        }
        let delay = self.base_delay(attempt);
        Some(if self.jitter { add_jitter(delay) } else { delay })
    }
}

/// Execute an async operation, retrying transient failures according to `policy`
///
/// # Returns
///
/// Returns the successful result or the last error after all retry attempts are exhausted.
pub async fn run_with_retry<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempts = attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => match policy.next_delay(attempt, &e) {
                Some(delay) => {
                    tracing::warn!(
                        error = %e,
                        attempt,
                        max_retries = policy.max_retries,
                        delay_ms = delay.as_millis(),
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    if e.is_retryable() {
                        tracing::error!(
                            error = %e,
                            attempts = attempt,
                            "Operation failed after all retry attempts exhausted"
                        );
                    } else {
                        tracing::error!(error = %e, "Operation failed with non-retryable error");
                    }
                    return Err(e);
                }
            },
        }
    }
}

/// Add random jitter to a delay
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the actual
/// delay lands between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
