//! agentrun Control Plane Library
//!
//! This crate provides the orchestrator for agentrun: a dynamically sized pool of
//! capability-bounded agents fed from a bounded task queue, with background dispatch,
//! result, health and metrics loops.

pub mod agent;
pub mod config;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod scheduler;
pub mod state;
pub mod store;

pub use agent::{
    Agent, AgentBase, AgentFactory, BuiltinAgent, BuiltinAgentFactory, ExecutionContext,
    ResilientAgent, ResilientAgentFactory, WorkloadSlot,
};
pub use config::OrchestratorConfig;
pub use error::{AgentError, EngineError, SchedulerError, StoreError};
pub use metrics::{render_prometheus, MetricsCollector, MetricsData};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, SweepReport};
pub use scheduler::{Placement, Scheduler};
pub use state::AppState;
pub use store::{MemoryResultStore, ResultStore, WorkflowEngine};
