//! Worker and subagent hierarchy.
//!
//! Every role shares one capability contract ([`Agent`]): execute a task
//! context, then report the result to the direct superior. Roles differ in
//! the focus they bring to the provider call, not in coordination.
//!
//! The agent tree itself lives in [`AgentRegistry`], owned by the lead.
//! Agents only ever hold their parent's id, never a live reference.

mod agent;
mod provider;
mod registry;
mod worker;

pub use agent::{Agent, AgentReport, AgentResult, ProviderAgent};
pub use provider::{
    AgentProvider, Artifact, ProviderRequest, ProviderResponse, RetryPolicy, TaskContext, Usage,
    invoke_with_retry,
};
pub use registry::{AgentRecord, AgentRegistry};
pub use worker::{
    Directive, IssueAssignment, PauseHandle, TaskOutcome, Worker, WorkerEvent, WorkerMessage,
    WorkerServices,
};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Backend,
    Frontend,
    Test,
    Review,
    Specialist,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backend => "backend",
            Self::Frontend => "frontend",
            Self::Test => "test",
            Self::Review => "review",
            Self::Specialist => "specialist",
        }
    }

    /// Standing instruction the role adds to every provider call.
    pub fn focus(&self) -> &'static str {
        match self {
            Self::Backend => "Implement server-side logic, persistence and APIs with tests.",
            Self::Frontend => "Implement user-facing components and their interaction tests.",
            Self::Test => "Write and run tests; report coverage and every failure.",
            Self::Review => "Review the change for defects, missing tests and risky patterns.",
            Self::Specialist => "Resolve the focused problem described and report concrete advice.",
        }
    }

    /// Pick the worker role for an issue from its text.
    pub fn for_text(text: &str) -> Self {
        const RULES: &[(&[&str], AgentRole)] = &[
            (&["frontend", "ui", "component", "css", "page"], AgentRole::Frontend),
            (&["test", "coverage", "qa"], AgentRole::Test),
            (&["review", "audit"], AgentRole::Review),
        ];
        let lower = text.to_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        RULES
            .iter()
            .find(|(keywords, _)| keywords.iter().any(|k| words.contains(k)))
            .map(|(_, role)| *role)
            .unwrap_or(AgentRole::Backend)
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backend" => Ok(Self::Backend),
            "frontend" => Ok(Self::Frontend),
            "test" => Ok(Self::Test),
            "review" => Ok(Self::Review),
            "specialist" => Ok(Self::Specialist),
            _ => Err(format!("Invalid agent role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Worker,
    Subagent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Busy,
    Blocked,
    Terminated,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Blocked => "blocked",
            Self::Terminated => "terminated",
        }
    }
}
