//! Core domain errors.

use thiserror::Error;

use crate::TaskStatus;

/// Core domain errors for agentrun.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A task was asked to move to a status its current status cannot reach.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: TaskStatus, to: TaskStatus },

    /// No agent kind declares the task type as a capability.
    #[error("No agent kind handles task type '{0}'")]
    UnknownTaskType(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
