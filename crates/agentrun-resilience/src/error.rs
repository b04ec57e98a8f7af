//! Errors returned by the resilience primitives.
//!
//! Each wrapper is generic over the wrapped operation's error so callers keep access to the
//! original failure.

use std::time::Duration;

use thiserror::Error;

/// Outcome of a retry loop that did not succeed.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The failure was classified as not worth retrying.
    #[error("{operation} failed with a non-retryable error: {source}")]
    NonRetryable {
        operation: String,
        #[source]
        source: E,
    },

    /// Every attempt failed.
    #[error("{operation} failed after {attempts} attempts: {source}")]
    Exhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: E,
    },

    /// Cancellation arrived while waiting between attempts.
    #[error("{operation} cancelled after {attempts} attempts")]
    Cancelled { operation: String, attempts: u32 },
}

impl<E> RetryError<E> {
    /// The last operation error, if the loop ended on one.
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::NonRetryable { source, .. } | Self::Exhausted { source, .. } => Some(source),
            Self::Cancelled { .. } => None,
        }
    }

    /// The last operation error, by reference.
    pub fn source_ref(&self) -> Option<&E> {
        match self {
            Self::NonRetryable { source, .. } | Self::Exhausted { source, .. } => Some(source),
            Self::Cancelled { .. } => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Error from a call routed through a circuit breaker.
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The circuit is open; the operation was not invoked.
    #[error("circuit breaker '{name}' is open (retry in {retry_in:?})")]
    Open { name: String, retry_in: Duration },

    /// The operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

/// Error from a call routed through a bulkhead.
#[derive(Debug, Error)]
pub enum BulkheadError<E> {
    /// No admission token was available.
    #[error("bulkhead '{name}' is full (max {max})")]
    Full { name: String, max: usize },

    /// Cancelled while waiting for an admission token.
    #[error("cancelled while waiting for bulkhead '{name}'")]
    Cancelled { name: String },

    /// The operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> BulkheadError<E> {
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full { .. })
    }
}
