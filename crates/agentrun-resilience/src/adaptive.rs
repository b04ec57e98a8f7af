//! Retry policy that tunes itself from observed outcomes.

use std::error::Error as StdError;
use std::future::Future;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::RetryError;
use crate::retry::RetryPolicy;

const DEFAULT_ADJUST_EVERY: u32 = 10;
const HIGH_SUCCESS_RATE: f64 = 0.9;
const LOW_SUCCESS_RATE: f64 = 0.5;
const MIN_ATTEMPTS: u32 = 2;
const MAX_ATTEMPTS: u32 = 10;
const MIN_FACTOR: f64 = 1.2;
const MAX_FACTOR: f64 = 3.0;
const FACTOR_STEP: f64 = 0.2;

#[derive(Debug)]
struct AdaptiveState {
    policy: RetryPolicy,
    calls: u32,
    successes: u32,
}

/// Wraps a [`RetryPolicy`] and adjusts it every `adjust_every` recorded outcomes.
///
/// A success rate above 90% lowers `max_attempts` and `backoff_factor`; a rate below 50% raises
/// them. Attempts stay within `[2, 10]` and the factor within `[1.2, 3.0]`.
#[derive(Debug)]
pub struct AdaptiveRetryPolicy {
    adjust_every: u32,
    state: Mutex<AdaptiveState>,
}

impl AdaptiveRetryPolicy {
    pub fn new(base: RetryPolicy) -> Self {
        Self::with_window(base, DEFAULT_ADJUST_EVERY)
    }

    /// Use a custom adjustment window (minimum 1).
    pub fn with_window(base: RetryPolicy, adjust_every: u32) -> Self {
        Self {
            adjust_every: adjust_every.max(1),
            state: Mutex::new(AdaptiveState {
                policy: base,
                calls: 0,
                successes: 0,
            }),
        }
    }

    /// Snapshot of the current effective policy.
    pub fn policy(&self) -> RetryPolicy {
        self.lock().policy.clone()
    }

    /// Record the outcome of one call.
    pub fn record(&self, success: bool) {
        let mut state = self.lock();
        state.calls += 1;
        if success {
            state.successes += 1;
        }
        if state.calls < self.adjust_every {
            return;
        }

        let rate = f64::from(state.successes) / f64::from(state.calls);
        let before = (state.policy.max_attempts, state.policy.backoff_factor);
        let policy = &mut state.policy;
        if rate > HIGH_SUCCESS_RATE {
            policy.max_attempts = policy.max_attempts.saturating_sub(1).max(MIN_ATTEMPTS);
            policy.backoff_factor = (policy.backoff_factor - FACTOR_STEP).max(MIN_FACTOR);
        } else if rate < LOW_SUCCESS_RATE {
            policy.max_attempts = (policy.max_attempts + 1).min(MAX_ATTEMPTS);
            policy.backoff_factor = (policy.backoff_factor + FACTOR_STEP).min(MAX_FACTOR);
        }

        if before != (policy.max_attempts, policy.backoff_factor) {
            info!(
                success_rate = rate,
                max_attempts = policy.max_attempts,
                backoff_factor = policy.backoff_factor,
                "Adjusted retry policy"
            );
        }
        state.calls = 0;
        state.successes = 0;
    }

    /// Run `f` under the current policy and record the outcome.
    ///
    /// Cancellation is not recorded as a failure.
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
        let policy = self.policy();
        let result = policy.run(cancel, operation, f).await;
        match &result {
            Ok(_) => self.record(true),
            Err(err) if !err.is_cancelled() => self.record(false),
            Err(_) => {}
        }
        result
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AdaptiveState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_high_success_rate_relaxes_policy() {
        let adaptive = AdaptiveRetryPolicy::new(RetryPolicy::default());
        for _ in 0..10 {
            adaptive.record(true);
        }
        let policy = adaptive.policy();
        assert_eq!(policy.max_attempts, 2);
        assert!((policy.backoff_factor - 1.8).abs() < 1e-9);

        for _ in 0..50 {
            adaptive.record(true);
        }
        let policy = adaptive.policy();
        assert_eq!(policy.max_attempts, MIN_ATTEMPTS);
        assert!((policy.backoff_factor - MIN_FACTOR).abs() < 1e-9);
    }

    #[test]
    fn test_low_success_rate_tightens_policy() {
        let adaptive = AdaptiveRetryPolicy::new(RetryPolicy::default());
        for _ in 0..10 {
            adaptive.record(false);
        }
        let policy = adaptive.policy();
        assert_eq!(policy.max_attempts, 4);
        assert!((policy.backoff_factor - 2.2).abs() < 1e-9);

        for _ in 0..200 {
            adaptive.record(false);
        }
        let policy = adaptive.policy();
        assert_eq!(policy.max_attempts, MAX_ATTEMPTS);
        assert!((policy.backoff_factor - MAX_FACTOR).abs() < 1e-9);
    }

    #[test]
    fn test_middling_rate_leaves_policy_alone() {
        let adaptive = AdaptiveRetryPolicy::new(RetryPolicy::default());
        for i in 0..10 {
            adaptive.record(i % 3 != 0);
        }
        assert_eq!(adaptive.policy(), RetryPolicy::default());
    }

    #[test]
    fn test_no_adjustment_before_window_fills() {
        let adaptive = AdaptiveRetryPolicy::with_window(RetryPolicy::default(), 4);
        for _ in 0..3 {
            adaptive.record(false);
        }
        assert_eq!(adaptive.policy().max_attempts, 3);
        adaptive.record(false);
        assert_eq!(adaptive.policy().max_attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_records_outcomes() {
        let base = RetryPolicy::default()
            .with_max_attempts(1)
            .with_max_jitter(Duration::ZERO);
        let adaptive = AdaptiveRetryPolicy::with_window(base, 2);
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let result: Result<(), _> = adaptive
                .run(&cancel, "render", || async {
                    Err(std::io::Error::other("connection refused"))
                })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(adaptive.policy().max_attempts, 2);
    }
}
