//! Circuit breaker for degraded dependencies.
//!
//! The breaker has three states:
//!
//! - **Closed**: calls pass through; consecutive failures are counted.
//! - **Open**: calls are rejected without invoking the operation.
//! - **HalfOpen**: calls pass through as probes; enough consecutive successes close the circuit,
//!   any failure reopens it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::CircuitError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing fast.
    Open,
    /// Probing for recovery.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// Time after the last failure before an open circuit lets a probe through.
    pub reset_timeout: Duration,

    /// Consecutive half-open successes that close the circuit.
    pub half_open_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_calls: 3,
        }
    }
}

/// Serializable snapshot of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitStats {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    /// Time since the last recorded failure.
    pub since_last_failure: Option<Duration>,
}

type StateChangeFn = dyn Fn(&str, CircuitState, CircuitState) + Send + Sync;

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
}

/// Circuit breaker guarding one named operation.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    on_state_change: Option<Arc<StateChangeFn>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("inner", &*self.lock())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
            }),
            on_state_change: None,
        }
    }

    /// Register a callback invoked with `(name, from, to)` on every transition.
    pub fn with_state_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(callback));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `f` through the breaker. Every error counts as a failure.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_filtered(f, |_| true).await
    }

    /// Run `f` through the breaker, counting only errors for which `is_failure` holds.
    ///
    /// Errors that do not count leave the breaker's counters untouched.
    pub async fn call_filtered<T, E, F, Fut, P>(
        &self,
        f: F,
        is_failure: P,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        self.admit()?;

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                if is_failure(&err) {
                    self.record_failure();
                }
                Err(CircuitError::Inner(err))
            }
        }
    }

    /// Run `f` through the breaker and hand any failure, including an open circuit, to
    /// `fallback`. The fallback's own outcome does not touch the counters.
    pub async fn call_with_fallback<T, E, F, Fut, B, BFut>(&self, f: F, fallback: B) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        B: FnOnce(CircuitError<E>) -> BFut,
        BFut: Future<Output = Result<T, E>>,
    {
        match self.call(f).await {
            Ok(value) => Ok(value),
            Err(err) => {
                debug!(breaker = %self.name, open = err.is_open(), "Circuit breaker fallback");
                fallback(err).await
            }
        }
    }

    /// Decide whether a call may proceed, moving an expired open circuit to half-open.
    fn admit<E>(&self) -> Result<(), CircuitError<E>> {
        let mut inner = self.lock();
        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let elapsed = inner
            .last_failure
            .map(|at| at.elapsed())
            .unwrap_or(self.config.reset_timeout);
        if elapsed < self.config.reset_timeout {
            return Err(CircuitError::Open {
                name: self.name.clone(),
                retry_in: self.config.reset_timeout - elapsed,
            });
        }

        inner.state = CircuitState::HalfOpen;
        inner.successes = 0;
        drop(inner);
        info!(breaker = %self.name, "Circuit breaker half-open");
        self.notify(CircuitState::Open, CircuitState::HalfOpen);
        Ok(())
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        let state = inner.state;
        match state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.half_open_calls {
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                    drop(inner);
                    info!(breaker = %self.name, "Circuit breaker closed");
                    self.notify(CircuitState::HalfOpen, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.last_failure = Some(Instant::now());
        let state = inner.state;
        match state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    let failures = inner.failures;
                    drop(inner);
                    warn!(breaker = %self.name, failures, "Circuit breaker opened");
                    self.notify(CircuitState::Closed, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.successes = 0;
                drop(inner);
                warn!(breaker = %self.name, "Circuit breaker reopened from half-open");
                self.notify(CircuitState::HalfOpen, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    /// Force the breaker back to closed with cleared counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let from = inner.state;
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.successes = 0;
        inner.last_failure = None;
        drop(inner);
        if from != CircuitState::Closed {
            info!(breaker = %self.name, "Circuit breaker reset");
            self.notify(from, CircuitState::Closed);
        }
    }

    pub fn stats(&self) -> CircuitStats {
        let inner = self.lock();
        CircuitStats {
            name: self.name.clone(),
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            since_last_failure: inner.last_failure.map(|at| at.elapsed()),
        }
    }

    fn notify(&self, from: CircuitState, to: CircuitState) {
        if let Some(callback) = &self.on_state_change {
            callback(&self.name, from, to);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One breaker per operation name, created on first use.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the breaker for `name`.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.lock();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(name).cloned()
    }

    /// Snapshots of every breaker, sorted by name.
    pub fn stats(&self) -> Vec<CircuitStats> {
        let breakers: Vec<_> = self.lock().values().cloned().collect();
        let mut stats: Vec<_> = breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn reset_all(&self) {
        let breakers: Vec<_> = self.lock().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
