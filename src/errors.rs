//! Typed error hierarchy for the foreman orchestrator.
//!
//! `ForemanError` is the boundary error returned by every component. Internal
//! plumbing (SQL, file IO, git) works in `anyhow::Result` and is converted to
//! `Persistence` or `CheckpointIncomplete` where it crosses a component edge.

use thiserror::Error;

/// Errors surfaced by the orchestration core.
#[derive(Debug, Error)]
pub enum ForemanError {
    /// Malformed identifiers or missing prerequisites. Rejected before any
    /// state mutation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A task was attempted before its dependencies completed.
    #[error("task {task} attempted before dependencies completed: {}", missing.join(", "))]
    DependencyNotSatisfied { task: String, missing: Vec<String> },

    /// One or more evidence thresholds were not met.
    #[error("task {task} failed evidence verification: {}", violations.join(", "))]
    EvidenceViolation { task: String, violations: Vec<String> },

    /// A durable-store write or read failed.
    #[error("persistence failure: {0:#}")]
    Persistence(#[source] anyhow::Error),

    /// A checkpoint sub-step failed; the checkpoint was discarded.
    #[error("checkpoint incomplete at step '{step}': {source:#}")]
    CheckpointIncomplete {
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// The agent provider failed or timed out after every retry.
    #[error("provider failure for {role} after {attempts} attempt(s): {message}")]
    ProviderFailure {
        role: String,
        attempts: u32,
        message: String,
    },

    #[error("invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Work was requested from a project that is not `active`.
    #[error("project {project_id} is {status}; tasks are only assigned while active")]
    NotActive { project_id: i64, status: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
}

impl ForemanError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn persistence(err: anyhow::Error) -> Self {
        Self::Persistence(err)
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn checkpoint(step: &'static str, source: anyhow::Error) -> Self {
        Self::CheckpointIncomplete { step, source }
    }

    /// Local, recoverable conditions the lead handles without surfacing a
    /// process-level fault.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::EvidenceViolation { .. } | Self::DependencyNotSatisfied { .. }
        )
    }
}

pub type Result<T, E = ForemanError> = std::result::Result<T, E>;
