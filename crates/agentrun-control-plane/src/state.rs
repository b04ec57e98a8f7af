//! Shared orchestrator state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use agentrun_core::{Task, TaskId, WorkerId, WorkerSummary};

use crate::agent::Agent;

/// Agent pool and task registry.
///
/// Each map has its own lock. Code that needs both takes `agents` before `tasks`.
pub struct AppState {
    /// Registered agents indexed by WorkerId.
    pub agents: RwLock<HashMap<WorkerId, Arc<dyn Agent>>>,

    /// Tasks indexed by TaskId.
    pub tasks: RwLock<HashMap<TaskId, Task>>,
}

impl AppState {
    /// Create a new AppState wrapped in Arc.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get the number of registered agents.
    pub async fn agent_count(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Get the number of tasks.
    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Register an agent directly, bypassing the factory.
    pub async fn register_agent(&self, agent: Arc<dyn Agent>) {
        self.agents.write().await.insert(agent.id().clone(), agent);
    }

    /// Summaries of every agent, sorted by id.
    pub async fn agent_summaries(&self) -> Vec<WorkerSummary> {
        let agents = self.agents.read().await;
        let mut summaries: Vec<_> = agents.values().map(|a| a.summary()).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::BuiltinAgent;
    use agentrun_core::AgentKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_empty_state() {
        let state = AppState::new();
        assert_eq!(state.agent_count().await, 0);
        assert_eq!(state.task_count().await, 0);
        assert!(state.agent_summaries().await.is_empty());
    }

    #[tokio::test]
    async fn test_register_and_count() {
        let state = AppState::new();
        for id in ["b", "a"] {
            let agent = BuiltinAgent::with_base(
                crate::agent::AgentBase::new(AgentKind::Parser).with_id(id),
            );
            state.register_agent(Arc::new(agent)).await;
        }

        let task = Task::new("parse", json!({}));
        state.tasks.write().await.insert(task.id.clone(), task);

        let summaries = state.agent_summaries().await;
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].id.as_str(), "a");
        assert_eq!(state.task_count().await, 1);
    }
}
