//! Resilience primitives for fallible operations.
//!
//! Everything here is task-agnostic and composes around any async operation:
//!
//! - [`ErrorClassifier`] maps an arbitrary failure to a [`ClassifiedError`] carrying
//!   retry and fallback hints.
//! - [`RetryPolicy`] retries with exponential backoff and jitter, aborting on cancellation.
//! - [`AdaptiveRetryPolicy`] nudges a retry policy based on the observed success rate.
//! - [`CircuitBreaker`] fails fast while a dependency is degraded.
//! - [`BulkheadLimiter`] caps concurrency and rejects instead of queuing.
//!
//! A typical composition, innermost first:
//!
//! ```rust,ignore
//! let output = breaker
//!     .call(|| policy.run(&cancel, "render", || client.render(&request)))
//!     .await?;
//! ```

pub mod adaptive;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod classify;
pub mod error;
pub mod retry;

pub use adaptive::AdaptiveRetryPolicy;
pub use bulkhead::BulkheadLimiter;
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, CircuitStats,
};
pub use classify::{ClassifiedError, ErrorClassifier, ErrorKind, RecoveryStrategy};
pub use error::{BulkheadError, CircuitError, RetryError};
pub use retry::RetryPolicy;
