//! Task scheduler - matches tasks to agents and grows the pool on demand.

use std::sync::Arc;

use tracing::{info, warn};

use agentrun_core::{Task, WorkerId};

use crate::agent::{Agent, AgentFactory, WorkloadSlot};
use crate::state::AppState;

/// Where a task should go.
pub enum Placement {
    /// An agent was selected and a workload slot reserved on it.
    Assigned(Arc<dyn Agent>, WorkloadSlot),
    /// Agents for this type exist or could exist, but none has room right now.
    Saturated,
    /// Nothing registered or creatable can serve this task type.
    Unsupported,
}

impl std::fmt::Debug for Placement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Assigned(agent, _) => f.debug_tuple("Assigned").field(agent.id()).finish(),
            Self::Saturated => f.write_str("Saturated"),
            Self::Unsupported => f.write_str("Unsupported"),
        }
    }
}

/// Task scheduler.
pub struct Scheduler {
    state: Arc<AppState>,
    factory: Arc<dyn AgentFactory>,
    max_agents: usize,
}

impl Scheduler {
    /// Create a new Scheduler.
    pub fn new(state: Arc<AppState>, factory: Arc<dyn AgentFactory>, max_agents: usize) -> Self {
        Self {
            state,
            factory,
            max_agents,
        }
    }

    /// Reserve a slot on the least-loaded agent that can handle `task`.
    ///
    /// Candidates are ordered by `(workload, id)`; the first one whose slot can be reserved wins.
    pub async fn select_agent(&self, task: &Task) -> Option<(Arc<dyn Agent>, WorkloadSlot)> {
        let mut candidates: Vec<(u32, WorkerId, Arc<dyn Agent>)> = {
            let agents = self.state.agents.read().await;
            agents
                .values()
                .filter(|agent| agent.can_handle(task))
                .map(|agent| (agent.base().workload(), agent.id().clone(), agent.clone()))
                .collect()
        };
        candidates.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

        candidates.into_iter().find_map(|(_, _, agent)| {
            let slot = agent.base().try_acquire().ok()?;
            Some((agent, slot))
        })
    }

    /// Select an agent for `task`, spawning one if the pool has room.
    pub async fn place(&self, task: &Task) -> Placement {
        if let Some((agent, slot)) = self.select_agent(task).await {
            return Placement::Assigned(agent, slot);
        }

        let mut agents = self.state.agents.write().await;
        if agents.len() < self.max_agents {
            if let Some(agent) = self.factory.create(&task.task_type) {
                if agent.can_handle(task) {
                    if let Ok(slot) = agent.base().try_acquire() {
                        info!(
                            agent_id = %agent.id(),
                            kind = %agent.base().kind(),
                            task_type = %task.task_type,
                            pool_size = agents.len() + 1,
                            "Spawned agent"
                        );
                        agents.insert(agent.id().clone(), agent.clone());
                        return Placement::Assigned(agent, slot);
                    }
                }
                warn!(
                    agent_id = %agent.id(),
                    task_type = %task.task_type,
                    "Factory produced an agent that cannot take the task"
                );
            }
        }

        let registered = agents
            .values()
            .any(|agent| agent.base().supports(&task.task_type));
        if registered || self.factory.supports(&task.task_type) {
            Placement::Saturated
        } else {
            Placement::Unsupported
        }
    }

    pub fn max_agents(&self) -> usize {
        self.max_agents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentBase, BuiltinAgent, BuiltinAgentFactory};
    use agentrun_core::AgentKind;
    use serde_json::json;

    fn scheduler(state: &Arc<AppState>, max_agents: usize) -> Scheduler {
        Scheduler::new(
            state.clone(),
            Arc::new(BuiltinAgentFactory::new().with_max_workload(1)),
            max_agents,
        )
    }

    async fn register(state: &AppState, id: &str, max_workload: u32) -> Arc<dyn Agent> {
        let agent: Arc<dyn Agent> = Arc::new(BuiltinAgent::with_base(
            AgentBase::new(AgentKind::Parser)
                .with_id(id)
                .with_max_workload(max_workload),
        ));
        state.register_agent(agent.clone()).await;
        agent
    }

    #[tokio::test]
    async fn test_select_prefers_least_loaded_then_id() {
        let state = AppState::new();
        let b = register(&state, "b", 3).await;
        let a = register(&state, "a", 3).await;
        let scheduler = scheduler(&state, 10);
        let task = Task::new("parse", json!({}));

        let (first, _s1) = scheduler.select_agent(&task).await.unwrap();
        assert_eq!(first.id(), a.id());

        let (second, _s2) = scheduler.select_agent(&task).await.unwrap();
        assert_eq!(second.id(), b.id());

        let (third, _s3) = scheduler.select_agent(&task).await.unwrap();
        assert_eq!(third.id(), a.id());
    }

    #[tokio::test]
    async fn test_place_spawns_until_pool_is_full() {
        let state = AppState::new();
        let scheduler = scheduler(&state, 2);
        let task = Task::new("generate", json!({}));

        let mut slots = Vec::new();
        for _ in 0..2 {
            match scheduler.place(&task).await {
                Placement::Assigned(_, slot) => slots.push(slot),
                other => panic!("unexpected placement: {other:?}"),
            }
        }
        assert_eq!(state.agent_count().await, 2);

        assert!(matches!(scheduler.place(&task).await, Placement::Saturated));
        assert_eq!(state.agent_count().await, 2);

        slots.pop();
        assert!(matches!(scheduler.place(&task).await, Placement::Assigned(..)));
    }

    #[tokio::test]
    async fn test_unknown_type_is_unsupported() {
        let state = AppState::new();
        let scheduler = scheduler(&state, 2);
        let task = Task::new("deploy", json!({}));

        assert!(matches!(scheduler.place(&task).await, Placement::Unsupported));
        assert_eq!(state.agent_count().await, 0);
    }

    #[tokio::test]
    async fn test_full_pool_of_other_kinds_is_saturated() {
        let state = AppState::new();
        let _parser = register(&state, "p", 1).await;
        let scheduler = scheduler(&state, 1);

        let task = Task::new("validate", json!({}));
        assert!(matches!(scheduler.place(&task).await, Placement::Saturated));
    }
}
