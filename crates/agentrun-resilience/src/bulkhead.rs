//! Concurrency limiter with immediate rejection.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::BulkheadError;

/// A fixed set of admission tokens.
///
/// [`execute`](Self::execute) never queues: if no token is free the call is rejected at once.
/// Tokens are released when the operation's future completes or is dropped.
#[derive(Debug, Clone)]
pub struct BulkheadLimiter {
    name: String,
    max: usize,
    permits: Arc<Semaphore>,
}

impl BulkheadLimiter {
    pub fn new(name: impl Into<String>, max_concurrency: usize) -> Self {
        Self {
            name: name.into(),
            max: max_concurrency,
            permits: Arc::new(Semaphore::new(max_concurrency)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_concurrency(&self) -> usize {
        self.max
    }

    /// Tokens currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Calls currently holding a token.
    pub fn in_flight(&self) -> usize {
        self.max.saturating_sub(self.available())
    }

    /// Run `f` if a token is free, otherwise fail with [`BulkheadError::Full`].
    pub async fn execute<T, E, F, Fut>(&self, f: F) -> Result<T, BulkheadError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(bulkhead = %self.name, max = self.max, "Bulkhead full, rejecting call");
                return Err(BulkheadError::Full {
                    name: self.name.clone(),
                    max: self.max,
                });
            }
        };
        f().await.map_err(BulkheadError::Inner)
    }

    /// Wait for a token, aborting if `cancel` fires first.
    pub async fn execute_waiting<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, BulkheadError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = self.permits.clone().acquire_owned() => permit.ok(),
        };
        let Some(_permit) = acquired else {
            return Err(BulkheadError::Cancelled {
                name: self.name.clone(),
            });
        };
        f().await.map_err(BulkheadError::Inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_third_call_rejected_immediately() {
        let bulkhead = BulkheadLimiter::new("scanner", 2);
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);

        let mut handles = Vec::new();
        for _ in 0..2 {
            let bulkhead = bulkhead.clone();
            let mut release = release_rx.clone();
            handles.push(tokio::spawn(async move {
                bulkhead
                    .execute(|| async move {
                        let _ = release.wait_for(|r| *r).await;
                        Ok::<_, ()>(())
                    })
                    .await
            }));
        }
        while bulkhead.in_flight() < 2 {
            tokio::task::yield_now().await;
        }

        let started = std::time::Instant::now();
        let result = bulkhead.execute(|| async { Ok::<_, ()>(()) }).await;
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(matches!(result, Err(BulkheadError::Full { max: 2, .. })));

        release_tx.send(true).unwrap();
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(bulkhead.available(), 2);
    }

    #[tokio::test]
    async fn test_token_released_on_error_and_drop() {
        let bulkhead = BulkheadLimiter::new("scanner", 1);

        let result = bulkhead.execute(|| async { Err::<(), _>("bad") }).await;
        assert!(matches!(result, Err(BulkheadError::Inner("bad"))));
        assert_eq!(bulkhead.available(), 1);

        let (_tx, rx) = oneshot::channel::<()>();
        let pending = bulkhead.execute(|| async move {
            let _ = rx.await;
            Ok::<_, ()>(())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());
        assert_eq!(bulkhead.available(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_while_waiting() {
        let bulkhead = BulkheadLimiter::new("scanner", 1);
        let (hold_tx, hold_rx) = oneshot::channel::<()>();
        let holder = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move {
                bulkhead
                    .execute(|| async move {
                        let _ = hold_rx.await;
                        Ok::<_, ()>(())
                    })
                    .await
            })
        };
        while bulkhead.available() > 0 {
            tokio::task::yield_now().await;
        }

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let result = bulkhead
            .execute_waiting(&cancel, || async { Ok::<_, ()>(()) })
            .await;
        assert!(matches!(result, Err(BulkheadError::Cancelled { .. })));

        hold_tx.send(()).unwrap();
        assert!(holder.await.unwrap().is_ok());
        let result = bulkhead
            .execute_waiting(&CancellationToken::new(), || async { Ok::<_, ()>(7) })
            .await;
        assert_eq!(result.unwrap(), 7);
    }
}
