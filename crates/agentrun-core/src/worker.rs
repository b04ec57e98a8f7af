//! Agent kinds and worker summaries.

use crate::{CoreError, WorkerId, WorkerStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The closed set of agent variants the orchestrator knows how to spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Parser,
    Generator,
    Validator,
    Tester,
    Documenter,
}

impl AgentKind {
    pub const ALL: [AgentKind; 5] = [
        AgentKind::Parser,
        AgentKind::Generator,
        AgentKind::Validator,
        AgentKind::Tester,
        AgentKind::Documenter,
    ];

    /// Task types an agent of this kind accepts.
    pub fn capabilities(&self) -> &'static [&'static str] {
        match self {
            Self::Parser => &["parse", "tokenize"],
            Self::Generator => &["generate", "create", "build"],
            Self::Validator => &["validate", "check", "verify"],
            Self::Tester => &["test", "generate_tests", "coverage"],
            Self::Documenter => &["document", "docs"],
        }
    }

    /// Default workload ceiling for a freshly spawned agent of this kind.
    pub fn default_max_workload(&self) -> u32 {
        match self {
            Self::Parser => 10,
            Self::Generator => 5,
            Self::Validator => 10,
            Self::Tester => 8,
            Self::Documenter => 6,
        }
    }

    /// Look up the agent kind that serves a task type.
    pub fn for_task_type(task_type: &str) -> Result<Self, CoreError> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.capabilities().contains(&task_type))
            .ok_or_else(|| CoreError::UnknownTaskType(task_type.to_string()))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parser => "parser",
            Self::Generator => "generator",
            Self::Validator => "validator",
            Self::Tester => "tester",
            Self::Documenter => "documenter",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown agent kind '{s}'")))
    }
}

/// Point-in-time view of a registered agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSummary {
    /// Unique worker identifier.
    pub id: WorkerId,

    /// Agent variant.
    pub kind: AgentKind,

    /// Current status.
    pub status: WorkerStatus,

    /// Task types the agent accepts.
    pub capabilities: Vec<String>,

    /// In-flight task count.
    pub workload: u32,

    /// Capacity ceiling.
    pub max_workload: u32,

    /// When the agent was created.
    pub created_at: DateTime<Utc>,

    /// When the agent last started executing a task.
    pub last_active_at: DateTime<Utc>,
}

impl WorkerSummary {
    /// Check if this worker declares the given task type.
    pub fn supports(&self, task_type: &str) -> bool {
        self.capabilities.iter().any(|c| c == task_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_type_lookup() {
        assert_eq!(AgentKind::for_task_type("generate").unwrap(), AgentKind::Generator);
        assert_eq!(AgentKind::for_task_type("check").unwrap(), AgentKind::Validator);
        assert_eq!(AgentKind::for_task_type("coverage").unwrap(), AgentKind::Tester);
        assert_eq!(AgentKind::for_task_type("parse").unwrap(), AgentKind::Parser);
        assert!(matches!(
            AgentKind::for_task_type("deploy"),
            Err(CoreError::UnknownTaskType(t)) if t == "deploy"
        ));
    }

    #[test]
    fn test_capabilities_do_not_overlap() {
        for kind in AgentKind::ALL {
            for cap in kind.capabilities() {
                assert_eq!(AgentKind::for_task_type(cap).unwrap(), kind);
            }
        }
    }

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in AgentKind::ALL {
            assert_eq!(kind.as_str().parse::<AgentKind>().unwrap(), kind);
        }
        assert!("deployer".parse::<AgentKind>().is_err());
    }
}
