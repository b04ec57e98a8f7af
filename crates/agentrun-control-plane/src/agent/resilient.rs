//! Retry and circuit breaking composed around an agent's domain work.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use agentrun_core::Task;
use agentrun_resilience::{
    CircuitBreaker, CircuitBreakerRegistry, CircuitError, ClassifiedError, ErrorClassifier,
    ErrorKind, RetryError, RetryPolicy,
};

use super::{Agent, AgentBase, AgentFactory, ExecutionContext};
use crate::error::AgentError;

/// Wraps an agent so each [`perform`](Agent::perform) call runs inside a circuit breaker, with
/// retries inside the breaker.
///
/// One breaker call covers the whole retry loop, so a task whose retries are exhausted counts as
/// a single breaker failure. Cancellation never counts.
pub struct ResilientAgent {
    inner: Arc<dyn Agent>,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
    classifier: ErrorClassifier,
}

impl ResilientAgent {
    pub fn new(inner: Arc<dyn Agent>, breaker: Arc<CircuitBreaker>, policy: RetryPolicy) -> Self {
        let classifier = ErrorClassifier::new(inner.base().kind().as_str());
        Self {
            inner,
            breaker,
            policy,
            classifier,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    fn classify(&self, ctx: &ExecutionContext, err: &AgentError) -> ClassifiedError {
        let service = self.classifier.service();
        if ctx.is_cancelled() {
            return ClassifiedError::new(ErrorKind::Critical, "CANCELLED", err.to_string(), service);
        }
        match err {
            AgentError::Failed(message) => self.classifier.classify_message(message),
            AgentError::TimedOut(_) => self.classifier.classify_message("timed out"),
            AgentError::InvalidInput(message) => {
                ClassifiedError::new(ErrorKind::Validation, "INVALID_INPUT", message, service)
                    .with_fallback()
            }
            AgentError::AtCapacity(_) | AgentError::Unavailable { .. } => {
                ClassifiedError::new(ErrorKind::Resource, "AGENT_UNAVAILABLE", err.to_string(), service)
            }
            AgentError::CircuitOpen(_) => {
                ClassifiedError::new(ErrorKind::Resource, "CIRCUIT_OPEN", err.to_string(), service)
            }
            AgentError::Cancelled
            | AgentError::RetriesExhausted { .. }
            | AgentError::Panicked(_) => {
                ClassifiedError::new(ErrorKind::Critical, "FATAL", err.to_string(), service)
            }
        }
    }
}

#[async_trait]
impl Agent for ResilientAgent {
    fn base(&self) -> &AgentBase {
        self.inner.base()
    }

    fn can_handle(&self, task: &Task) -> bool {
        self.inner.can_handle(task)
    }

    async fn perform(&self, ctx: &ExecutionContext, task: &Task) -> Result<Value, AgentError> {
        let operation = format!("{}:{}", self.base().kind(), task.task_type);
        let result = self
            .breaker
            .call_filtered(
                || {
                    self.policy.run_classified(
                        ctx.token(),
                        &operation,
                        |err: &AgentError| self.classify(ctx, err),
                        || self.inner.perform(ctx, task),
                    )
                },
                |err: &RetryError<AgentError>| {
                    !err.is_cancelled() && !err.source_ref().is_some_and(AgentError::is_cancellation)
                },
            )
            .await;

        match result {
            Ok(output) => Ok(output),
            Err(CircuitError::Open { name, .. }) => Err(AgentError::CircuitOpen(name)),
            Err(CircuitError::Inner(RetryError::Exhausted {
                attempts, source, ..
            })) => Err(AgentError::RetriesExhausted {
                attempts,
                source: Box::new(source),
            }),
            Err(CircuitError::Inner(RetryError::NonRetryable { source, .. })) => Err(source),
            Err(CircuitError::Inner(RetryError::Cancelled { .. })) => Err(ctx.cancellation_error()),
        }
    }
}

/// Wraps every agent produced by another factory in a [`ResilientAgent`].
///
/// Agents of the same kind share one breaker from the registry.
pub struct ResilientAgentFactory<F> {
    inner: F,
    breakers: Arc<CircuitBreakerRegistry>,
    policy: RetryPolicy,
}

impl<F: AgentFactory> ResilientAgentFactory<F> {
    pub fn new(inner: F, breakers: Arc<CircuitBreakerRegistry>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            breakers,
            policy,
        }
    }
}

impl<F: AgentFactory> AgentFactory for ResilientAgentFactory<F> {
    fn create(&self, task_type: &str) -> Option<Arc<dyn Agent>> {
        let inner = self.inner.create(task_type)?;
        let breaker = self.breakers.get_or_create(inner.base().kind().as_str());
        Some(Arc::new(ResilientAgent::new(
            inner,
            breaker,
            self.policy.clone(),
        )))
    }

    fn supports(&self, task_type: &str) -> bool {
        self.inner.supports(task_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrun_core::AgentKind;
    use agentrun_resilience::{CircuitBreakerConfig, CircuitState};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Fails with `error` for the first `failures` calls.
    struct FlakyAgent {
        base: AgentBase,
        failures: u32,
        error: &'static str,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Agent for FlakyAgent {
        fn base(&self) -> &AgentBase {
            &self.base
        }

        async fn perform(&self, _ctx: &ExecutionContext, task: &Task) -> Result<Value, AgentError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                return Err(if self.error == "invalid" {
                    AgentError::InvalidInput("missing prompt".into())
                } else {
                    AgentError::Failed(self.error.into())
                });
            }
            Ok(json!({"attempt": n, "task": task.id}))
        }
    }

    fn flaky(failures: u32, error: &'static str) -> Arc<FlakyAgent> {
        Arc::new(FlakyAgent {
            base: AgentBase::new(AgentKind::Generator).with_unhealthy_after(None),
            failures,
            error,
            calls: AtomicU32::new(0),
        })
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_intervals(Duration::ZERO, Duration::ZERO)
            .with_max_jitter(Duration::ZERO)
    }

    fn breaker(threshold: u32) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "generator",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                ..CircuitBreakerConfig::default()
            },
        ))
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(CancellationToken::new())
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let inner = flaky(2, "connection refused");
        let agent = ResilientAgent::new(inner.clone(), breaker(5), policy(3));
        let mut task = Task::new("generate", json!({}));

        agent.execute(&ctx(), &mut task).await.unwrap();

        assert_eq!(task.output.unwrap()["attempt"], 3);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(agent.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_invalid_input_is_not_retried() {
        let inner = flaky(10, "invalid");
        let agent = ResilientAgent::new(inner.clone(), breaker(5), policy(3));
        let mut task = Task::new("generate", json!({}));

        let err = agent.execute(&ctx(), &mut task).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidInput(_)));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_opens_breaker() {
        let inner = flaky(100, "503 service unavailable");
        let agent = ResilientAgent::new(inner.clone(), breaker(2), policy(2));

        for _ in 0..2 {
            let mut task = Task::new("generate", json!({}));
            let err = agent.execute(&ctx(), &mut task).await.unwrap_err();
            assert!(matches!(err, AgentError::RetriesExhausted { attempts: 2, .. }));
        }
        assert_eq!(agent.breaker().state(), CircuitState::Open);

        let mut task = Task::new("generate", json!({}));
        let err = agent.execute(&ctx(), &mut task).await.unwrap_err();
        assert!(matches!(err, AgentError::CircuitOpen(name) if name == "generator"));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_factory_shares_breaker_per_kind() {
        let registry = Arc::new(CircuitBreakerRegistry::default());
        let factory = ResilientAgentFactory::new(
            crate::agent::BuiltinAgentFactory::new(),
            registry.clone(),
            policy(1),
        );

        let a = factory.create("generate").unwrap();
        let b = factory.create("build").unwrap();
        assert_ne!(a.id(), b.id());
        assert!(factory.create("deploy").is_none());
        assert_eq!(registry.stats().len(), 1);
        assert_eq!(registry.stats()[0].name, "generator");
    }
}
