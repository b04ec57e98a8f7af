//! Error types for the orchestrator and its collaborators.

use std::time::Duration;

use thiserror::Error;

use agentrun_core::{CoreError, TaskId, TaskStatus, WorkerId, WorkerStatus};

/// Errors returned by an agent's execution path.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent {0} is at capacity")]
    AtCapacity(WorkerId),

    #[error("agent {id} is not accepting tasks (status: {status})")]
    Unavailable { id: WorkerId, status: WorkerStatus },

    #[error("execution cancelled")]
    Cancelled,

    #[error("execution timed out after {0:?}")]
    TimedOut(Duration),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Failed(String),

    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<AgentError>,
    },

    #[error("agent panicked: {0}")]
    Panicked(String),
}

impl AgentError {
    /// Whether this error came from the caller's cancellation rather than the agent itself.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors returned by the orchestrator's public operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task already exists: {0}")]
    DuplicateTask(TaskId),

    #[error("Task {id} cannot be cancelled in status {status}")]
    NotCancellable { id: TaskId, status: TaskStatus },

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Errors from a [`ResultStore`](crate::store::ResultStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("result store timed out after {0:?}")]
    Timeout(Duration),

    #[error("result store is closed")]
    Closed,

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Errors from a [`WorkflowEngine`](crate::store::WorkflowEngine) handle.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow engine error: {0}")]
    Unavailable(String),
}
