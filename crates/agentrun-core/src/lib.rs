//! agentrun core domain types
//!
//! This crate contains pure domain types with no dependencies on:
//! - an async runtime
//! - persistence backends
//! - transport framing
//!
//! Everything the orchestrator, the agents and the callers exchange is defined here.

pub mod error;
pub mod ids;
pub mod status;
pub mod task;
pub mod worker;

// Re-export commonly used types
pub use error::CoreError;
pub use ids::{TaskId, WorkerId};
pub use status::{TaskPriority, TaskStatus, WorkerStatus};
pub use task::{Task, TaskEvent};
pub use worker::{AgentKind, WorkerSummary};
