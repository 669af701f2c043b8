//! Lead orchestration: turns a work breakdown into worker runs.
//!
//! The lead assigns whole issues to workers, one worker per issue, and is
//! the only writer of the issue/task graph and the agent registry. Workers
//! report over a channel; every status change is persisted before the lead
//! answers.

mod lead;
mod transitions;

pub use lead::{LeadOrchestrator, LeadServices, RunSummary};
pub use transitions::{check_issue, check_task};

use std::time::Duration;

use crate::agents::RetryPolicy;

/// Worker pool and retry settings.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Issues executed concurrently.
    pub max_workers: usize,
    /// Registered agents (workers and subagents) alive at once.
    pub max_agents: usize,
    /// Corrective retries per task before escalating or failing it.
    pub task_retry_budget: u32,
    /// Provider retries per call before the attempt counts as failed.
    pub provider_retry_budget: u32,
    pub provider_timeout: Duration,
    pub provider_backoff: Duration,
    /// Token budget of the context slice handed to a subagent.
    pub subagent_context_tokens: usize,
    pub skills: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_agents: 10,
            task_retry_budget: 2,
            provider_retry_budget: 3,
            provider_timeout: Duration::from_secs(600),
            provider_backoff: Duration::from_millis(500),
            subagent_context_tokens: 4_000,
            skills: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.provider_retry_budget,
            timeout: self.provider_timeout,
            backoff: self.provider_backoff,
        }
    }
}
