//! Agent factories keyed by task type.

use std::sync::Arc;
use std::time::Duration;

use agentrun_core::AgentKind;

use super::variants::BuiltinAgent;
use super::{Agent, AgentBase, DEFAULT_UNHEALTHY_AFTER};

/// Creates a new agent able to serve a task type, or `None` if the type is unsupported.
pub trait AgentFactory: Send + Sync {
    fn create(&self, task_type: &str) -> Option<Arc<dyn Agent>>;

    /// Whether [`create`](Self::create) would produce an agent for this type.
    fn supports(&self, task_type: &str) -> bool {
        self.create(task_type).is_some()
    }
}

impl<F> AgentFactory for F
where
    F: Fn(&str) -> Option<Arc<dyn Agent>> + Send + Sync,
{
    fn create(&self, task_type: &str) -> Option<Arc<dyn Agent>> {
        self(task_type)
    }
}

/// Spawns [`BuiltinAgent`]s using the static task-type table on [`AgentKind`].
#[derive(Debug, Clone, Default)]
pub struct BuiltinAgentFactory {
    work_duration: Option<Duration>,
    max_workload: Option<u32>,
    unhealthy_after: Option<Option<u32>>,
}

impl BuiltinAgentFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the same simulated work duration for every kind.
    pub fn with_work_duration(mut self, work: Duration) -> Self {
        self.work_duration = Some(work);
        self
    }

    /// Cap every agent's workload ceiling at `max`.
    pub fn with_max_workload(mut self, max: u32) -> Self {
        self.max_workload = Some(max);
        self
    }

    pub fn with_unhealthy_after(mut self, threshold: Option<u32>) -> Self {
        self.unhealthy_after = Some(threshold);
        self
    }

    /// Build the agent for a known kind.
    pub fn build(&self, kind: AgentKind) -> BuiltinAgent {
        let ceiling = match self.max_workload {
            Some(cap) => kind.default_max_workload().min(cap),
            None => kind.default_max_workload(),
        };
        let base = AgentBase::new(kind)
            .with_max_workload(ceiling)
            .with_unhealthy_after(self.unhealthy_after.unwrap_or(Some(DEFAULT_UNHEALTHY_AFTER)));

        let agent = BuiltinAgent::with_base(base);
        match self.work_duration {
            Some(work) => agent.with_work_duration(work),
            None => agent,
        }
    }
}

impl AgentFactory for BuiltinAgentFactory {
    fn create(&self, task_type: &str) -> Option<Arc<dyn Agent>> {
        let kind = AgentKind::for_task_type(task_type).ok()?;
        Some(Arc::new(self.build(kind)))
    }

    fn supports(&self, task_type: &str) -> bool {
        AgentKind::for_task_type(task_type).is_ok()
    }
}
