//! Retry with exponential backoff and jitter.

use std::error::Error as StdError;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::classify::{ClassifiedError, ErrorClassifier};
use crate::error::RetryError;

/// Backoff parameters and the retry loop that applies them.
///
/// The delay before retry `n` (1-based) is
/// `min(initial_interval * backoff_factor^(n-1), max_interval) + uniform(0, max_jitter)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_interval: Duration,

    /// Upper bound on the pre-jitter delay.
    pub max_interval: Duration,

    /// Multiplier applied per attempt.
    pub backoff_factor: f64,

    /// Upper bound on the random jitter added to each delay.
    pub max_jitter: Duration,

    /// Codes retried even when their classification says otherwise.
    pub retryable_codes: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_jitter: Duration::from_secs(1),
            retryable_codes: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Calls to slow remote dependencies (model providers, third-party APIs).
    ///
    /// More attempts and a gentler backoff than the default.
    pub fn remote_call() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(60),
            backoff_factor: 1.5,
            max_jitter: Duration::from_secs(2),
            retryable_codes: codes(&[
                "RATE_LIMIT",
                "TIMEOUT",
                "SERVICE_UNAVAILABLE",
                "NETWORK_ERROR",
                "SERVER_ERROR",
            ]),
        }
    }

    /// Cheap in-process operations where waiting long is pointless.
    pub fn fast_local() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_jitter: Duration::from_millis(50),
            retryable_codes: Vec::new(),
        }
    }

    /// A policy that makes a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_intervals(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_interval = initial;
        self.max_interval = max;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    pub fn with_retryable_code(mut self, code: impl Into<String>) -> Self {
        self.retryable_codes.push(code.into());
        self
    }

    /// Pre-jitter delay before retry `attempt` (1-based; 0 is treated as 1).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let max = self.max_interval.as_secs_f64();
        let secs = self.initial_interval.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= max {
            return self.max_interval;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Delay before retry `attempt`, jitter included.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Like [`delay`](Self::delay) with a caller-supplied random source.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let jitter_nanos = u64::try_from(self.max_jitter.as_nanos()).unwrap_or(u64::MAX);
        let jitter = if jitter_nanos == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(rng.gen_range(0..=jitter_nanos))
        };
        self.base_delay(attempt).saturating_add(jitter)
    }

    /// Whether a classified failure should be retried under this policy.
    pub fn is_retryable(&self, classified: &ClassifiedError) -> bool {
        classified.is_retryable() || self.retryable_codes.iter().any(|c| c == classified.code())
    }

    /// Run `f` until it succeeds, fails with a non-retryable error, exhausts its attempts, or
    /// `cancel` fires while waiting between attempts.
    ///
    /// Errors are classified with an [`ErrorClassifier`] named after `operation`.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        f: F,
    ) -> Result<T, RetryError<E>>
    where
        E: StdError + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let classifier = ErrorClassifier::new(operation);
        self.run_classified(cancel, operation, |e: &E| classifier.classify(e), f)
            .await
    }

    /// [`run`](Self::run) with a custom classification function.
    pub async fn run_classified<T, E, C, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        classify: C,
        mut f: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::fmt::Display,
        C: Fn(&E) -> ClassifiedError,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled {
                    operation: operation.to_string(),
                    attempts: attempt,
                });
            }
            attempt += 1;

            let err = match f().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let classified = classify(&err);
            if !self.is_retryable(&classified) {
                debug!(
                    operation,
                    attempt,
                    code = classified.code(),
                    error = %err,
                    "Operation failed with a non-retryable error"
                );
                return Err(RetryError::NonRetryable {
                    operation: operation.to_string(),
                    source: err,
                });
            }

            if attempt >= max_attempts {
                error!(
                    operation,
                    attempts = attempt,
                    code = classified.code(),
                    error = %err,
                    "Operation failed, retries exhausted"
                );
                return Err(RetryError::Exhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.delay(attempt);
            warn!(
                operation,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                code = classified.code(),
                error = %err,
                "Operation failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled {
                        operation: operation.to_string(),
                        attempts: attempt,
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run `f` with retries and fall back to `fallback` when the final failure is
    /// fallback-eligible.
    ///
    /// A failing fallback is reported as a non-retryable error of `"<operation> fallback"`.
    /// Cancellation never triggers the fallback.
    pub async fn run_with_fallback<T, E, F, Fut, B, BFut>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        f: F,
        fallback: B,
    ) -> Result<T, RetryError<E>>
    where
        E: StdError + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        B: FnOnce(ClassifiedError) -> BFut,
        BFut: Future<Output = Result<T, E>>,
    {
        let classifier = ErrorClassifier::new(operation);
        let err = match self
            .run_classified(cancel, operation, |e: &E| classifier.classify(e), f)
            .await
        {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let classified = match err.source_ref() {
            Some(source) => classifier.classify(source),
            None => return Err(err),
        };
        if !classified.allows_fallback() {
            return Err(err);
        }

        warn!(operation, code = classified.code(), "Using fallback");
        fallback(classified)
            .await
            .map_err(|source| RetryError::NonRetryable {
                operation: format!("{operation} fallback"),
                source,
            })
    }
}

fn codes(codes: &[&str]) -> Vec<String> {
    codes.iter().map(|c| c.to_string()).collect()
}
