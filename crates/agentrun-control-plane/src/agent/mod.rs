//! Agent abstraction.
//!
//! An [`Agent`] declares which task types it accepts, tracks its in-flight workload against a
//! fixed ceiling and runs its domain logic in [`Agent::perform`]. The shared bookkeeping lives in
//! [`AgentBase`], which every implementation embeds.
//!
//! Workload is reserved through [`WorkloadSlot`]s. A slot is taken with a compare-and-swap that
//! never exceeds `max_workload` and is released when the slot is dropped, so the count is
//! restored on every exit path including timeouts, cancellation and panics.

pub mod factory;
pub mod resilient;
pub mod variants;

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use agentrun_core::{AgentKind, Task, WorkerId, WorkerStatus, WorkerSummary};

use crate::error::AgentError;

pub use factory::{AgentFactory, BuiltinAgentFactory};
pub use resilient::{ResilientAgent, ResilientAgentFactory};
pub use variants::BuiltinAgent;

/// Consecutive failures after which an agent marks itself unhealthy by default.
pub const DEFAULT_UNHEALTHY_AFTER: u32 = 5;

/// Bounds a single execution: a cancellation signal plus an optional deadline.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
}

impl ExecutionContext {
    /// A context that ends only when `cancel` fires.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
            timeout: None,
        }
    }

    /// A context that also ends `timeout` from now.
    pub fn with_timeout(cancel: CancellationToken, timeout: Duration) -> Self {
        Self {
            cancel,
            deadline: Some(Instant::now() + timeout),
            timeout: Some(timeout),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline_passed()
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }

    /// The error an execution reports when this context ends it.
    pub fn cancellation_error(&self) -> AgentError {
        match self.timeout {
            Some(timeout) if self.deadline_passed() => AgentError::TimedOut(timeout),
            _ => AgentError::Cancelled,
        }
    }

    /// Wait for `duration` unless the context ends first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), AgentError> {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(self.cancellation_error()),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

/// A reserved unit of an agent's workload, released on drop.
#[derive(Debug)]
pub struct WorkloadSlot {
    workload: Arc<AtomicU32>,
}

impl Drop for WorkloadSlot {
    fn drop(&mut self) {
        self.workload.fetch_sub(1, Ordering::AcqRel);
    }
}

/// State shared by every agent implementation.
#[derive(Debug)]
pub struct AgentBase {
    id: WorkerId,
    kind: AgentKind,
    capabilities: Vec<String>,
    max_workload: u32,
    workload: Arc<AtomicU32>,
    status: RwLock<WorkerStatus>,
    consecutive_failures: AtomicU32,
    unhealthy_after: Option<u32>,
    created_at: DateTime<Utc>,
    last_active_ms: AtomicI64,
}

impl AgentBase {
    /// A base with a generated id and the kind's default capabilities and ceiling.
    pub fn new(kind: AgentKind) -> Self {
        let now = Utc::now();
        Self {
            id: WorkerId::generate(),
            kind,
            capabilities: kind.capabilities().iter().map(|c| c.to_string()).collect(),
            max_workload: kind.default_max_workload(),
            workload: Arc::new(AtomicU32::new(0)),
            status: RwLock::new(WorkerStatus::Active),
            consecutive_failures: AtomicU32::new(0),
            unhealthy_after: Some(DEFAULT_UNHEALTHY_AFTER),
            created_at: now,
            last_active_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn with_id(mut self, id: impl Into<WorkerId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_max_workload(mut self, max_workload: u32) -> Self {
        self.max_workload = max_workload;
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Mark the agent unhealthy after this many consecutive failures. `None` disables it.
    pub fn with_unhealthy_after(mut self, threshold: Option<u32>) -> Self {
        self.unhealthy_after = threshold;
        self
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn max_workload(&self) -> u32 {
        self.max_workload
    }

    pub fn workload(&self) -> u32 {
        self.workload.load(Ordering::Acquire)
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn supports(&self, task_type: &str) -> bool {
        self.capabilities.iter().any(|c| c == task_type)
    }

    /// Active, declares the task's type and has spare capacity.
    pub fn can_handle(&self, task: &Task) -> bool {
        self.status().can_accept_tasks()
            && self.workload() < self.max_workload
            && self.supports(&task.task_type)
    }

    /// Reserve one unit of workload.
    pub fn try_acquire(&self) -> Result<WorkloadSlot, AgentError> {
        let status = self.status();
        if !status.can_accept_tasks() {
            return Err(AgentError::Unavailable {
                id: self.id.clone(),
                status,
            });
        }

        let max = self.max_workload;
        self.workload
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                (w < max).then(|| w + 1)
            })
            .map_err(|_| AgentError::AtCapacity(self.id.clone()))?;

        Ok(WorkloadSlot {
            workload: self.workload.clone(),
        })
    }

    fn touch(&self) {
        self.last_active_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    pub fn last_active_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_active_ms.load(Ordering::Acquire))
            .single()
            .unwrap_or(self.created_at)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Update the failure streak after an execution. Cancellations are ignored.
    pub fn record_outcome<T>(&self, result: &Result<T, AgentError>) {
        match result {
            Ok(_) => self.consecutive_failures.store(0, Ordering::Release),
            Err(err) if err.is_cancellation() => {}
            Err(_) => self.record_failure(),
        }
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(threshold) = self.unhealthy_after {
            if failures >= threshold && self.status() == WorkerStatus::Active {
                warn!(
                    agent_id = %self.id,
                    kind = %self.kind,
                    failures,
                    "Agent marked unhealthy after consecutive failures"
                );
                self.set_status(WorkerStatus::Unhealthy);
            }
        }
    }

    pub fn mark_unhealthy(&self) {
        self.set_status(WorkerStatus::Unhealthy);
    }

    fn set_status(&self, status: WorkerStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Stop accepting tasks. Returns false if the agent was already stopped.
    pub fn stop(&self) -> bool {
        let mut current = self.status.write().unwrap_or_else(|e| e.into_inner());
        if *current == WorkerStatus::Stopped {
            return false;
        }
        *current = WorkerStatus::Stopped;
        true
    }

    pub fn summary(&self) -> WorkerSummary {
        WorkerSummary {
            id: self.id.clone(),
            kind: self.kind,
            status: self.status(),
            capabilities: self.capabilities.clone(),
            workload: self.workload(),
            max_workload: self.max_workload,
            created_at: self.created_at,
            last_active_at: self.last_active_at(),
        }
    }
}

/// A capability-bounded task executor.
#[async_trait]
pub trait Agent: Send + Sync {
    fn base(&self) -> &AgentBase;

    /// Domain logic for one task. Must observe `ctx` for cancellation.
    async fn perform(&self, ctx: &ExecutionContext, task: &Task) -> Result<Value, AgentError>;

    fn id(&self) -> &WorkerId {
        self.base().id()
    }

    /// Side-effect free acceptance check.
    fn can_handle(&self, task: &Task) -> bool {
        self.base().can_handle(task)
    }

    /// Reserve a slot and execute `task`, storing the output on success.
    async fn execute(&self, ctx: &ExecutionContext, task: &mut Task) -> Result<(), AgentError> {
        let slot = self.base().try_acquire()?;
        self.execute_reserved(slot, ctx, task).await
    }

    /// Execute `task` under a slot reserved by the caller.
    async fn execute_reserved(
        &self,
        slot: WorkloadSlot,
        ctx: &ExecutionContext,
        task: &mut Task,
    ) -> Result<(), AgentError> {
        let _slot = slot;
        let base = self.base();
        base.touch();

        let result = tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(ctx.cancellation_error()),
            output = self.perform(ctx, task) => output,
        };
        base.record_outcome(&result);

        task.output = Some(result?);
        Ok(())
    }

    /// Stop accepting tasks. Idempotent.
    fn stop(&self) {
        let base = self.base();
        if base.stop() {
            info!(agent_id = %base.id(), kind = %base.kind(), "Agent stopped");
        }
    }

    fn summary(&self) -> WorkerSummary {
        self.base().summary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoAgent {
        base: AgentBase,
        delay: Duration,
    }

    #[async_trait]
    impl Agent for EchoAgent {
        fn base(&self) -> &AgentBase {
            &self.base
        }

        async fn perform(&self, ctx: &ExecutionContext, task: &Task) -> Result<Value, AgentError> {
            ctx.sleep(self.delay).await?;
            match task.input.get("fail").and_then(Value::as_str) {
                Some(reason) => Err(AgentError::Failed(reason.to_string())),
                None => Ok(task.input.clone()),
            }
        }
    }

    fn echo(max_workload: u32, delay: Duration) -> EchoAgent {
        EchoAgent {
            base: AgentBase::new(AgentKind::Parser).with_max_workload(max_workload),
            delay,
        }
    }

    #[test]
    fn test_slots_respect_ceiling() {
        let agent = echo(2, Duration::ZERO);
        let task = Task::new("parse", json!({}));

        let a = agent.base().try_acquire().unwrap();
        let b = agent.base().try_acquire().unwrap();
        assert_eq!(agent.base().workload(), 2);
        assert!(!agent.can_handle(&task));
        assert!(matches!(
            agent.base().try_acquire(),
            Err(AgentError::AtCapacity(_))
        ));

        drop(a);
        assert!(agent.can_handle(&task));
        drop(b);
        assert_eq!(agent.base().workload(), 0);
    }

    struct GatedAgent {
        base: AgentBase,
        gate: tokio::sync::Semaphore,
        peak: AtomicU32,
    }

    #[async_trait]
    impl Agent for GatedAgent {
        fn base(&self) -> &AgentBase {
            &self.base
        }

        async fn perform(&self, _ctx: &ExecutionContext, _task: &Task) -> Result<Value, AgentError> {
            self.peak.fetch_max(self.base.workload(), Ordering::SeqCst);
            let _open = self
                .gate
                .acquire()
                .await
                .map_err(|e| AgentError::Failed(e.to_string()))?;
            Ok(json!({}))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_executes_never_exceed_ceiling() {
        let agent = Arc::new(GatedAgent {
            base: AgentBase::new(AgentKind::Parser).with_max_workload(3),
            gate: tokio::sync::Semaphore::new(0),
            peak: AtomicU32::new(0),
        });

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let agent = agent.clone();
                tokio::spawn(async move {
                    let mut task = Task::new("parse", json!({}));
                    agent
                        .execute(&ExecutionContext::new(CancellationToken::new()), &mut task)
                        .await
                })
            })
            .collect();

        // Five callers bounce off the ceiling while three hold slots behind the gate.
        let deadline = Instant::now() + Duration::from_secs(5);
        while handles.iter().filter(|h| h.is_finished()).count() < 5 {
            assert!(Instant::now() < deadline, "rejections never arrived");
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(agent.base().workload(), 3);
        agent.gate.add_permits(8);

        let mut completed = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => completed += 1,
                Err(AgentError::AtCapacity(_)) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!((completed, rejected), (3, 5));
        assert_eq!(agent.peak.load(Ordering::SeqCst), 3);
        assert_eq!(agent.base().workload(), 0);
    }

    #[test]
    fn test_can_handle_checks_capabilities() {
        let agent = echo(1, Duration::ZERO);
        assert!(agent.can_handle(&Task::new("tokenize", json!({}))));
        assert!(!agent.can_handle(&Task::new("generate", json!({}))));
    }

    #[tokio::test]
    async fn test_execute_sets_output() {
        let agent = echo(1, Duration::ZERO);
        let mut task = Task::new("parse", json!({"source": "a b"}));

        agent
            .execute(&ExecutionContext::new(CancellationToken::new()), &mut task)
            .await
            .unwrap();

        assert_eq!(task.output, Some(json!({"source": "a b"})));
        assert_eq!(agent.base().workload(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_reports_timeout_and_releases_slot() {
        let agent = echo(1, Duration::from_secs(60));
        let mut task = Task::new("parse", json!({}));
        let ctx = ExecutionContext::with_timeout(CancellationToken::new(), Duration::from_secs(1));

        let err = agent.execute(&ctx, &mut task).await.unwrap_err();
        assert!(matches!(err, AgentError::TimedOut(d) if d == Duration::from_secs(1)));
        assert_eq!(agent.base().workload(), 0);
        assert!(task.output.is_none());
    }

    #[tokio::test]
    async fn test_cancellation_is_not_a_failure() {
        let agent = echo(1, Duration::from_secs(60));
        let mut task = Task::new("parse", json!({}));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = agent
            .execute(&ExecutionContext::new(cancel), &mut task)
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(agent.base().consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_failure_streak_marks_unhealthy() {
        let agent = EchoAgent {
            base: AgentBase::new(AgentKind::Parser).with_unhealthy_after(Some(2)),
            delay: Duration::ZERO,
        };
        let ctx = ExecutionContext::new(CancellationToken::new());

        for _ in 0..2 {
            let mut task = Task::new("parse", json!({"fail": "bad token"}));
            let err = agent.execute(&ctx, &mut task).await.unwrap_err();
            assert_eq!(err.to_string(), "bad token");
        }

        assert_eq!(agent.base().status(), WorkerStatus::Unhealthy);
        let mut task = Task::new("parse", json!({}));
        assert!(matches!(
            agent.execute(&ctx, &mut task).await,
            Err(AgentError::Unavailable { .. })
        ));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let agent = echo(1, Duration::ZERO);
        agent.stop();
        agent.stop();
        assert_eq!(agent.base().status(), WorkerStatus::Stopped);
        assert!(!agent.base().stop());
        assert!(!agent.can_handle(&Task::new("parse", json!({}))));
    }

    #[test]
    fn test_summary_reflects_state() {
        let agent = echo(3, Duration::ZERO);
        let _slot = agent.base().try_acquire().unwrap();
        let summary = agent.summary();
        assert_eq!(summary.kind, AgentKind::Parser);
        assert_eq!(summary.workload, 1);
        assert_eq!(summary.max_workload, 3);
        assert!(summary.supports("tokenize"));
    }
}
