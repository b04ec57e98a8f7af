//! Orchestrator - owns the agent pool and runs the background loops.
//!
//! Four loops run for the orchestrator's lifetime:
//!
//! - **dispatch** pulls task ids off the bounded submission queue, asks the [`Scheduler`] for an
//!   agent and launches the execution, or requeues the task with backoff when the pool is full.
//! - **result** persists finished tasks, updates the registry and publishes the terminal event.
//! - **health** evicts agents that marked themselves unhealthy and drops expired terminal tasks.
//! - **metrics** periodically snapshots [`MetricsData`].
//!
//! Executions and requeue timers run on a [`TaskTracker`] so [`Orchestrator::stop`] can wait
//! for every one of them after cancelling the shared shutdown token.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use agentrun_core::{Task, TaskEvent, TaskId, TaskStatus, WorkerId, WorkerStatus, WorkerSummary};

use crate::agent::{Agent, AgentFactory, BuiltinAgentFactory, ExecutionContext, WorkloadSlot};
use crate::config::OrchestratorConfig;
use crate::error::{AgentError, SchedulerError, StoreError};
use crate::metrics::{MetricsCollector, MetricsData};
use crate::scheduler::{Placement, Scheduler};
use crate::state::AppState;
use crate::store::{ResultStore, WorkflowEngine};

/// Buffered task events per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 1024;

/// What a health sweep removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub evicted_agents: Vec<WorkerId>,
    pub evicted_tasks: usize,
}

/// Builds and starts an [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    factory: Option<Arc<dyn AgentFactory>>,
    store: Option<Arc<dyn ResultStore>>,
    engine: Option<Arc<dyn WorkflowEngine>>,
    state: Option<Arc<AppState>>,
}

impl OrchestratorBuilder {
    /// Agent factory used to grow the pool. Defaults to [`BuiltinAgentFactory`] capped at
    /// `max_tasks_per_agent`.
    pub fn factory(mut self, factory: impl AgentFactory + 'static) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    pub fn store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn workflow_engine(mut self, engine: Arc<dyn WorkflowEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Share an existing state, e.g. one with pre-registered agents.
    pub fn state(mut self, state: Arc<AppState>) -> Self {
        self.state = Some(state);
        self
    }

    /// Spawn the background loops. Must be called inside a Tokio runtime.
    pub fn start(self) -> Orchestrator {
        let config = self.config;
        let (task_tx, task_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (result_tx, result_rx) = mpsc::channel(config.result_capacity.max(1));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let state = self.state.unwrap_or_else(AppState::new);
        let factory = self.factory.unwrap_or_else(|| {
            Arc::new(BuiltinAgentFactory::new().with_max_workload(config.max_tasks_per_agent))
        });

        let inner = Arc::new(Inner {
            scheduler: Scheduler::new(state.clone(), factory, config.max_agents),
            metrics: MetricsCollector::new(config.duration_window),
            state,
            store: self.store,
            engine: self.engine,
            task_tx,
            result_tx,
            events,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            stopping: AtomicBool::new(false),
            last_metrics: RwLock::new(None),
            config,
        });

        let mut loops = vec![
            tokio::spawn(inner.clone().dispatch_loop(task_rx)),
            tokio::spawn(inner.clone().result_loop(result_rx)),
            tokio::spawn(inner.clone().health_loop()),
        ];
        if inner.config.metrics_enabled {
            loops.push(tokio::spawn(inner.clone().metrics_loop()));
        }

        info!(
            max_agents = inner.config.max_agents,
            queue_capacity = inner.config.queue_capacity,
            task_timeout_ms = inner.config.task_timeout.as_millis() as u64,
            "Orchestrator started"
        );

        Orchestrator {
            inner,
            loops: Mutex::new(loops),
            stopped: tokio::sync::Mutex::new(false),
        }
    }
}

/// Dynamic agent pool with a bounded task queue.
pub struct Orchestrator {
    inner: Arc<Inner>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    stopped: tokio::sync::Mutex<bool>,
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            factory: None,
            store: None,
            engine: None,
            state: None,
        }
    }

    /// Start with the built-in agent factory and no collaborators.
    pub fn start(config: OrchestratorConfig) -> Self {
        Self::builder(config).start()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.inner.state
    }

    /// Accept a task for dispatch.
    ///
    /// An empty id is replaced with a generated one and the status is reset to pending. The
    /// caller's `created_at` is kept. When the queue is full the call waits up to
    /// `submit_grace` for room, then rejects the task. A rejected task is never recorded and
    /// never published.
    pub async fn submit(&self, mut task: Task) -> Result<TaskId, SchedulerError> {
        let inner = &self.inner;
        if inner.stopping.load(Ordering::Acquire) {
            return Err(SchedulerError::ShuttingDown);
        }

        if task.id.is_empty() {
            task.id = TaskId::generate();
        }
        task.status = TaskStatus::Pending;
        task.agent_id = None;
        task.output = None;
        task.error = None;
        task.assigned_at = None;
        task.completed_at = None;
        task.requeue_count = 0;

        let id = task.id.clone();
        if inner.state.tasks.read().await.contains_key(&id) {
            return Err(SchedulerError::DuplicateTask(id));
        }

        let permit = match inner.reserve_slot().await {
            Ok(permit) => permit,
            Err(err) => {
                warn!(task_id = %id, task_type = %task.task_type, error = %err, "Task rejected");
                return Err(err);
            }
        };

        {
            // The id is sent under the task lock; the dispatcher's shutdown drain relies on it.
            let mut tasks = inner.state.tasks.write().await;
            if inner.stopping.load(Ordering::Acquire) {
                return Err(SchedulerError::ShuttingDown);
            }
            if tasks.contains_key(&id) {
                return Err(SchedulerError::DuplicateTask(id));
            }
            tasks.insert(id.clone(), task.clone());
            inner.metrics.increment_total();
            inner.emit(&task);
            permit.send(id.clone());
        }

        info!(
            task_id = %id,
            task_type = %task.task_type,
            priority = ?task.priority,
            "Task submitted"
        );
        Ok(id)
    }

    pub async fn get_task(&self, id: &TaskId) -> Result<Task, SchedulerError> {
        self.inner
            .state
            .tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::TaskNotFound(id.clone()))
    }

    /// Cancel a task that has not been dispatched yet.
    pub async fn cancel(&self, id: &TaskId) -> Result<(), SchedulerError> {
        let task = {
            let mut tasks = self.inner.state.tasks.write().await;
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| SchedulerError::TaskNotFound(id.clone()))?;
            if task.status != TaskStatus::Pending {
                return Err(SchedulerError::NotCancellable {
                    id: id.clone(),
                    status: task.status,
                });
            }
            task.cancel()?;
            task.clone()
        };

        info!(task_id = %id, "Task cancelled");
        self.inner.emit(&task);
        Ok(())
    }

    /// Summaries of every agent in the pool, sorted by id.
    pub async fn list_workers(&self) -> Vec<WorkerSummary> {
        self.inner.state.agent_summaries().await
    }

    /// Receive every task status change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    /// Fresh metrics snapshot.
    pub async fn metrics(&self) -> MetricsData {
        self.inner.collect_metrics().await
    }

    /// Snapshot taken by the last metrics tick, if any.
    pub fn last_metrics(&self) -> Option<MetricsData> {
        self.inner
            .last_metrics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Tasks waiting in the submission queue.
    pub fn queue_len(&self) -> usize {
        self.inner.queue_len()
    }

    /// Run one health sweep now instead of waiting for the next tick.
    pub async fn run_health_sweep(&self) -> SweepReport {
        self.inner.health_sweep().await
    }

    /// Graceful shutdown.
    ///
    /// Rejects new submissions, cancels in-flight executions, waits for every loop and
    /// execution to exit, stops all agents and closes the collaborators. Every step runs even
    /// when closing one of them fails; the first close error is returned. Calling it again
    /// returns `Ok(())`.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let mut stopped = self.stopped.lock().await;
        if *stopped {
            return Ok(());
        }

        info!("Stopping orchestrator");
        let inner = &self.inner;
        inner.stopping.store(true, Ordering::Release);
        inner.shutdown.cancel();

        let loops = std::mem::take(&mut *self.loops.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in loops {
            if let Err(err) = handle.await {
                error!(error = %err, "Orchestrator loop panicked");
            }
        }

        inner.tracker.close();
        inner.tracker.wait().await;

        let agents: Vec<Arc<dyn Agent>> = inner.state.agents.read().await.values().cloned().collect();
        for agent in &agents {
            agent.stop();
        }

        let mut result = Ok(());
        if let Some(store) = &inner.store {
            if let Err(err) = store.close().await {
                warn!(error = %err, "Failed to close result store");
                result = Err(err.into());
            }
        }
        if let Some(engine) = &inner.engine {
            if let Err(err) = engine.close().await {
                warn!(engine = engine.name(), error = %err, "Failed to close workflow engine");
                if result.is_ok() {
                    result = Err(err.into());
                }
            }
        }

        *stopped = true;
        info!(agents = agents.len(), "Orchestrator stopped");
        result
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

struct Inner {
    config: OrchestratorConfig,
    state: Arc<AppState>,
    scheduler: Scheduler,
    metrics: MetricsCollector,
    store: Option<Arc<dyn ResultStore>>,
    engine: Option<Arc<dyn WorkflowEngine>>,
    task_tx: mpsc::Sender<TaskId>,
    result_tx: mpsc::Sender<Task>,
    events: broadcast::Sender<TaskEvent>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    stopping: AtomicBool,
    last_metrics: RwLock<Option<MetricsData>>,
}

impl Inner {
    fn emit(&self, task: &Task) {
        // No subscribers is not an error.
        let _ = self.events.send(TaskEvent::of(task));
    }

    fn queue_len(&self) -> usize {
        self.task_tx.max_capacity() - self.task_tx.capacity()
    }

    /// Reserve room in the submission queue, waiting up to `submit_grace` when it is full.
    async fn reserve_slot(&self) -> Result<mpsc::Permit<'_, TaskId>, SchedulerError> {
        let capacity = self.config.queue_capacity;
        match self.task_tx.try_reserve() {
            Ok(permit) => return Ok(permit),
            Err(TrySendError::Closed(())) => return Err(SchedulerError::ShuttingDown),
            Err(TrySendError::Full(())) => {}
        }

        let grace = self.config.submit_grace;
        if grace.is_zero() {
            return Err(SchedulerError::QueueFull { capacity });
        }
        match tokio::time::timeout(grace, self.task_tx.reserve()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(SchedulerError::ShuttingDown),
            Err(_) => Err(SchedulerError::QueueFull { capacity }),
        }
    }

    async fn dispatch_loop(self: Arc<Self>, mut rx: mpsc::Receiver<TaskId>) {
        debug!("Dispatch loop started");
        loop {
            let id = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                id = rx.recv() => match id {
                    Some(id) => id,
                    None => break,
                },
            };
            self.dispatch(&id).await;
        }

        rx.close();
        // Wait out any submit still inside its critical section.
        drop(self.state.tasks.write().await);
        let mut drained = 0;
        while let Ok(id) = rx.try_recv() {
            self.cancel_pending(&id, "Task cancelled at shutdown").await;
            drained += 1;
        }
        debug!(drained, "Dispatch loop stopped");
    }

    async fn dispatch(self: &Arc<Self>, id: &TaskId) {
        let task = match self.state.tasks.read().await.get(id) {
            Some(task) if task.status == TaskStatus::Pending => task.clone(),
            Some(task) => {
                debug!(task_id = %id, status = %task.status, "Skipping task that is no longer pending");
                return;
            }
            None => return,
        };

        match self.scheduler.place(&task).await {
            Placement::Assigned(agent, slot) => self.launch(id, agent, slot).await,
            Placement::Saturated => self.requeue(id).await,
            Placement::Unsupported => {
                let reason = format!("no agent can handle task type '{}'", task.task_type);
                self.fail_pending(id, reason).await;
            }
        }
    }

    async fn launch(self: &Arc<Self>, id: &TaskId, agent: Arc<dyn Agent>, slot: WorkloadSlot) {
        let task = {
            let mut tasks = self.state.tasks.write().await;
            let Some(task) = tasks.get_mut(id) else {
                return;
            };
            if let Err(err) = task.assign(agent.id().clone()) {
                debug!(task_id = %id, error = %err, "Task changed before assignment");
                return;
            }
            task.clone()
        };

        info!(
            task_id = %id,
            agent_id = %agent.id(),
            task_type = %task.task_type,
            "Assigning task to agent"
        );
        self.emit(&task);

        let inner = self.clone();
        self.tracker
            .spawn(async move { inner.run_execution(task, agent, slot).await });
    }

    async fn run_execution(self: Arc<Self>, mut task: Task, agent: Arc<dyn Agent>, slot: WorkloadSlot) {
        let timeout = self.config.task_timeout;
        let cancel = self.shutdown.child_token();
        let ctx = ExecutionContext::with_timeout(cancel.clone(), timeout);

        match task.start() {
            Ok(()) => self.update_task(&task).await,
            Err(err) => warn!(task_id = %task.id, error = %err, "Failed to mark task in progress"),
        }

        let execution = AssertUnwindSafe(agent.execute_reserved(slot, &ctx, &mut task)).catch_unwind();
        let result = match tokio::time::timeout(timeout, execution).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                agent.base().record_failure();
                Err(AgentError::Panicked(panic_message(panic.as_ref())))
            }
            Err(_) => {
                cancel.cancel();
                agent.base().record_failure();
                Err(AgentError::TimedOut(timeout))
            }
        };

        let outcome = match result {
            Ok(()) => task.complete(),
            Err(err) => {
                warn!(
                    task_id = %task.id,
                    agent_id = %agent.id(),
                    error = %err,
                    "Task execution failed"
                );
                task.fail(err.to_string())
            }
        };
        if let Err(err) = outcome {
            warn!(task_id = %task.id, error = %err, "Failed to record task outcome");
        }

        if let Err(SendError(task)) = self.result_tx.send(task).await {
            self.process_result(task).await;
        }
    }

    async fn update_task(&self, task: &Task) {
        if let Some(entry) = self.state.tasks.write().await.get_mut(&task.id) {
            *entry = task.clone();
        }
        self.emit(task);
    }

    async fn requeue(self: &Arc<Self>, id: &TaskId) {
        let max_requeues = self.config.max_requeues;
        let requeues = {
            let mut tasks = self.state.tasks.write().await;
            match tasks.get_mut(id) {
                Some(task) if task.status == TaskStatus::Pending => {
                    if task.requeue_count >= max_requeues {
                        None
                    } else {
                        task.requeue_count += 1;
                        Some(task.requeue_count)
                    }
                }
                _ => return,
            }
        };
        let Some(requeues) = requeues else {
            let reason = format!("no agent available after {max_requeues} requeues");
            self.fail_pending(id, reason).await;
            return;
        };

        let delay = self.config.requeue_policy.delay(requeues);
        debug!(
            task_id = %id,
            requeues,
            delay_ms = delay.as_millis() as u64,
            "No agent available, requeueing task"
        );

        let inner = self.clone();
        let id = id.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => {
                    inner.cancel_pending(&id, "Task cancelled at shutdown").await;
                }
                _ = tokio::time::sleep(delay) => {
                    if let Err(SendError(id)) = inner.task_tx.send(id).await {
                        inner.cancel_pending(&id, "Task cancelled at shutdown").await;
                    }
                }
            }
        });
    }

    async fn fail_pending(&self, id: &TaskId, reason: String) {
        let task = {
            let mut tasks = self.state.tasks.write().await;
            let Some(task) = tasks.get_mut(id) else {
                return;
            };
            if task.status != TaskStatus::Pending || task.fail(reason.as_str()).is_err() {
                return;
            }
            task.clone()
        };

        warn!(task_id = %id, task_type = %task.task_type, error = %reason, "Task failed before dispatch");
        self.process_result(task).await;
    }

    async fn cancel_pending(&self, id: &TaskId, message: &'static str) {
        let task = {
            let mut tasks = self.state.tasks.write().await;
            let Some(task) = tasks.get_mut(id) else {
                return;
            };
            if task.status != TaskStatus::Pending || task.cancel().is_err() {
                return;
            }
            task.clone()
        };
        info!(task_id = %id, "{}", message);
        self.emit(&task);
    }

    async fn result_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Task>) {
        debug!("Result loop started");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                task = rx.recv() => match task {
                    Some(task) => self.process_result(task).await,
                    None => break,
                },
            }
        }

        rx.close();
        while let Some(task) = rx.recv().await {
            self.process_result(task).await;
        }
        debug!("Result loop stopped");
    }

    /// Record a terminal task: metrics, persistence, registry, event. Called once per task.
    async fn process_result(&self, task: Task) {
        match task.status {
            TaskStatus::Completed => self.metrics.increment_completed(),
            TaskStatus::Failed => self.metrics.increment_failed(),
            _ => {}
        }
        if let Some(duration) = task.execution_duration() {
            self.metrics.record_duration(duration);
        }

        if let Some(store) = &self.store {
            let stored = tokio::time::timeout(self.config.store_timeout, store.store(&task))
                .await
                .unwrap_or(Err(StoreError::Timeout(self.config.store_timeout)));
            if let Err(err) = stored {
                warn!(task_id = %task.id, error = %err, "Failed to store task result");
            }
        }

        if task.status == TaskStatus::Completed {
            info!(
                task_id = %task.id,
                agent_id = ?task.agent_id.as_ref().map(WorkerId::as_str),
                duration_ms = task.execution_duration().map(|d| d.as_millis() as u64),
                "Task completed"
            );
        }

        self.state
            .tasks
            .write()
            .await
            .insert(task.id.clone(), task.clone());
        self.emit(&task);
    }

    async fn health_loop(self: Arc<Self>) {
        let period = self.config.health_check_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.health_sweep().await;
                }
            }
        }
        debug!("Health loop stopped");
    }

    async fn health_sweep(&self) -> SweepReport {
        let evicted: Vec<Arc<dyn Agent>> = {
            let mut agents = self.state.agents.write().await;
            let unhealthy: Vec<WorkerId> = agents
                .values()
                .filter(|agent| agent.base().status() == WorkerStatus::Unhealthy)
                .map(|agent| agent.id().clone())
                .collect();
            unhealthy.iter().filter_map(|id| agents.remove(id)).collect()
        };
        for agent in &evicted {
            warn!(
                agent_id = %agent.id(),
                kind = %agent.base().kind(),
                failures = agent.base().consecutive_failures(),
                "Evicting unhealthy agent"
            );
            agent.stop();
        }

        let evicted_tasks = match self.config.task_retention {
            Some(retention) => self.evict_tasks(retention).await,
            None => 0,
        };
        if evicted_tasks > 0 {
            debug!(evicted_tasks, "Evicted expired tasks");
        }

        SweepReport {
            evicted_agents: evicted.iter().map(|agent| agent.id().clone()).collect(),
            evicted_tasks,
        }
    }

    async fn evict_tasks(&self, retention: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };

        let mut tasks = self.state.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, task| {
            !(task.is_terminal() && task.completed_at.is_some_and(|at| at <= cutoff))
        });
        before - tasks.len()
    }

    async fn metrics_loop(self: Arc<Self>) {
        let period = self.config.metrics_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let data = self.collect_metrics().await;
                    info!(
                        agents = data.agents,
                        busy_agents = data.busy_agents,
                        total_tasks = data.total_tasks,
                        completed_tasks = data.completed_tasks,
                        failed_tasks = data.failed_tasks,
                        queued_tasks = data.queued_tasks,
                        average_task_time_ms = data.average_task_time_ms,
                        success_rate = data.success_rate,
                        system_load = data.system_load,
                        "Metrics snapshot"
                    );
                    *self.last_metrics.write().unwrap_or_else(|e| e.into_inner()) = Some(data);
                }
            }
        }
        debug!("Metrics loop stopped");
    }

    async fn collect_metrics(&self) -> MetricsData {
        let (agents, busy_agents, system_load) = {
            let agents = self.state.agents.read().await;
            let mut busy = 0;
            let mut workload = 0u64;
            let mut capacity = 0u64;
            for agent in agents.values() {
                let base = agent.base();
                let current = base.workload();
                if current > 0 {
                    busy += 1;
                }
                workload += u64::from(current);
                capacity += u64::from(base.max_workload());
            }
            let load = if capacity == 0 {
                0.0
            } else {
                workload as f64 / capacity as f64
            };
            (agents.len(), busy, load)
        };

        MetricsData {
            max_agents: self.scheduler.max_agents(),
            agents,
            busy_agents,
            total_tasks: self.metrics.total(),
            completed_tasks: self.metrics.completed(),
            failed_tasks: self.metrics.failed(),
            queued_tasks: self.queue_len(),
            average_task_time_ms: self.metrics.average_duration().as_secs_f64() * 1000.0,
            success_rate: self.metrics.success_rate(),
            system_load,
            collected_at: Utc::now(),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
