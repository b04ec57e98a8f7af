//! Orchestrator configuration.

use std::time::Duration;

use agentrun_resilience::RetryPolicy;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum number of agents in the pool.
    pub max_agents: usize,

    /// Upper bound on any built-in agent's workload ceiling.
    pub max_tasks_per_agent: u32,

    /// Per-task execution timeout.
    pub task_timeout: Duration,

    /// Interval between health sweeps.
    pub health_check_interval: Duration,

    /// Whether the metrics loop runs.
    pub metrics_enabled: bool,

    /// Interval between metrics snapshots.
    pub metrics_interval: Duration,

    /// Capacity of the submission queue.
    pub queue_capacity: usize,

    /// Capacity of the result queue.
    pub result_capacity: usize,

    /// How long `submit` waits on a full queue before rejecting. Zero rejects at once.
    pub submit_grace: Duration,

    /// Upper bound on a single result store call.
    pub store_timeout: Duration,

    /// Number of recent execution durations kept for averages.
    pub duration_window: usize,

    /// Backoff between requeues of a task no agent could take.
    pub requeue_policy: RetryPolicy,

    /// Requeues allowed before the task is failed.
    pub max_requeues: u32,

    /// How long terminal tasks stay in the registry. `None` keeps them forever.
    pub task_retention: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_agents: 10,
            max_tasks_per_agent: 5,
            task_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            metrics_enabled: true,
            metrics_interval: Duration::from_secs(30),
            queue_capacity: 1000,
            result_capacity: 1000,
            submit_grace: Duration::from_secs(5),
            store_timeout: Duration::from_secs(5),
            duration_window: 1000,
            requeue_policy: RetryPolicy::default()
                .with_intervals(Duration::from_secs(1), Duration::from_secs(30))
                .with_max_jitter(Duration::from_millis(250)),
            max_requeues: 10,
            task_retention: Some(Duration::from_secs(3600)),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_max_agents(mut self, max_agents: usize) -> Self {
        self.max_agents = max_agents;
        self
    }

    pub fn with_max_tasks_per_agent(mut self, max: u32) -> Self {
        self.max_tasks_per_agent = max;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_metrics(mut self, enabled: bool, interval: Duration) -> Self {
        self.metrics_enabled = enabled;
        self.metrics_interval = interval;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_result_capacity(mut self, capacity: usize) -> Self {
        self.result_capacity = capacity;
        self
    }

    pub fn with_submit_grace(mut self, grace: Duration) -> Self {
        self.submit_grace = grace;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_duration_window(mut self, window: usize) -> Self {
        self.duration_window = window;
        self
    }

    pub fn with_requeue(mut self, policy: RetryPolicy, max_requeues: u32) -> Self {
        self.requeue_policy = policy;
        self.max_requeues = max_requeues;
        self
    }

    pub fn with_task_retention(mut self, retention: Option<Duration>) -> Self {
        self.task_retention = retention;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_agents, 10);
        assert_eq!(config.max_tasks_per_agent, 5);
        assert_eq!(config.task_timeout, Duration::from_secs(30));
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.submit_grace, Duration::from_secs(5));
        assert_eq!(config.requeue_policy.base_delay(1), Duration::from_secs(1));
        assert_eq!(config.requeue_policy.base_delay(20), Duration::from_secs(30));
    }

    #[test]
    fn test_builder_overrides() {
        let config = OrchestratorConfig::default()
            .with_max_agents(2)
            .with_submit_grace(Duration::ZERO)
            .with_task_retention(None);
        assert_eq!(config.max_agents, 2);
        assert!(config.submit_grace.is_zero());
        assert!(config.task_retention.is_none());
    }
}
