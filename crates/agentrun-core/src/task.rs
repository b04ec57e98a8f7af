//! Task type and task lifecycle events.

use crate::{CoreError, TaskId, TaskPriority, TaskStatus, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// A Task is a unit of work submitted to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier. Left empty to have one generated on submit.
    pub id: TaskId,

    /// Discriminator used for capability matching and agent kind selection.
    pub task_type: String,

    /// Task priority.
    pub priority: TaskPriority,

    /// Current task status.
    pub status: TaskStatus,

    /// Agent the task was assigned to.
    pub agent_id: Option<WorkerId>,

    /// Caller-defined input payload.
    pub input: Value,

    /// Agent-produced output, set on success.
    pub output: Option<Value>,

    /// Failure reason, set only when the task failed.
    pub error: Option<String>,

    /// Task labels/metadata.
    pub metadata: HashMap<String, String>,

    /// When the task was submitted.
    pub created_at: DateTime<Utc>,

    /// When the task was bound to an agent.
    pub assigned_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,

    /// Advisory deadline. Only the per-execution timeout is enforced.
    pub deadline: Option<DateTime<Utc>>,

    /// How many times the task went back to the queue because no agent was free.
    pub requeue_count: u32,
}

impl Task {
    /// Create a new pending Task.
    pub fn new(task_type: impl Into<String>, input: Value) -> Self {
        Self {
            id: TaskId::generate(),
            task_type: task_type.into(),
            priority: TaskPriority::default(),
            status: TaskStatus::Pending,
            agent_id: None,
            input,
            output: None,
            error: None,
            metadata: HashMap::new(),
            created_at: Utc::now(),
            assigned_at: None,
            completed_at: None,
            deadline: None,
            requeue_count: 0,
        }
    }

    /// Builder method to set a specific ID.
    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    /// Builder method to set the priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder method to set an advisory deadline.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Builder method to add a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn transition(&mut self, next: TaskStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidStateTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Bind the task to an agent.
    pub fn assign(&mut self, agent_id: WorkerId) -> Result<(), CoreError> {
        self.transition(TaskStatus::Assigned)?;
        self.agent_id = Some(agent_id);
        self.assigned_at = Some(Utc::now());
        Ok(())
    }

    /// Mark the task as executing.
    pub fn start(&mut self) -> Result<(), CoreError> {
        self.transition(TaskStatus::InProgress)
    }

    /// Mark the task as completed.
    pub fn complete(&mut self) -> Result<(), CoreError> {
        self.transition(TaskStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Mark the task as failed.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), CoreError> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Mark the task as cancelled.
    pub fn cancel(&mut self) -> Result<(), CoreError> {
        self.transition(TaskStatus::Cancelled)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Time between assignment and completion, once both are known.
    pub fn execution_duration(&self) -> Option<Duration> {
        let assigned = self.assigned_at?;
        let completed = self.completed_at?;
        (completed - assigned).to_std().ok()
    }
}

/// A task lifecycle event, published on every status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Task this event belongs to.
    pub task_id: TaskId,
    /// Status the task moved to.
    pub status: TaskStatus,
    /// Agent bound to the task at the time of the event.
    pub agent_id: Option<WorkerId>,
    /// When the transition happened.
    pub at: DateTime<Utc>,
}

impl TaskEvent {
    /// Capture the current status of a task.
    pub fn of(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            status: task.status,
            agent_id: task.agent_id.clone(),
            at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_task_is_pending() {
        let task = Task::new("generate", json!({"prompt": "hello world"}));
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.agent_id.is_none());
        assert!(task.assigned_at.is_none());
        assert!(!task.id.is_empty());
    }

    #[test]
    fn test_full_lifecycle() {
        let mut task = Task::new("validate", json!({}));
        task.assign(WorkerId::new("w-1")).unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert!(task.assigned_at.is_some());

        task.start().unwrap();
        task.complete().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.execution_duration().is_some());
        assert!(task.error.is_none());
    }

    #[test]
    fn test_terminal_transition_happens_once() {
        let mut task = Task::new("test", json!({}));
        task.assign(WorkerId::new("w-1")).unwrap();
        task.start().unwrap();
        task.fail("boom").unwrap();

        let err = task.complete().unwrap_err();
        assert_eq!(
            err,
            CoreError::InvalidStateTransition {
                from: TaskStatus::Failed,
                to: TaskStatus::Completed
            }
        );
        assert_eq!(task.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_cancel_only_before_assignment() {
        let mut pending = Task::new("parse", json!({}));
        pending.cancel().unwrap();
        assert_eq!(pending.status, TaskStatus::Cancelled);

        let mut assigned = Task::new("parse", json!({}));
        assigned.assign(WorkerId::new("w-2")).unwrap();
        assert!(assigned.cancel().is_err());
    }

    #[test]
    fn test_event_captures_status() {
        let mut task = Task::new("document", json!({})).with_label("team", "docs");
        task.assign(WorkerId::new("w-3")).unwrap();
        let event = TaskEvent::of(&task);
        assert_eq!(event.status, TaskStatus::Assigned);
        assert_eq!(event.agent_id, Some(WorkerId::new("w-3")));
        assert_eq!(task.metadata.get("team").map(String::as_str), Some("docs"));
    }
}
