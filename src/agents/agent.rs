use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::AgentRole;
use super::provider::{
    AgentProvider, Artifact, ProviderRequest, RetryPolicy, TaskContext, Usage, invoke_with_retry,
};
use crate::errors::ForemanError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_id: String,
    pub output: String,
    pub artifacts: Vec<Artifact>,
    pub usage: Usage,
}

/// A result addressed to the agent's direct superior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReport {
    pub agent_id: String,
    /// `None` for workers, which report to the lead.
    pub parent: Option<String>,
    pub result: AgentResult,
}

/// Capability contract shared by every role.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    fn role(&self) -> AgentRole;

    fn parent(&self) -> Option<&str>;

    async fn execute(&self, task: TaskContext) -> Result<AgentResult, ForemanError>;

    fn report(&self, result: AgentResult) -> AgentReport {
        AgentReport {
            agent_id: self.id().to_string(),
            parent: self.parent().map(str::to_string),
            result,
        }
    }
}

/// An agent whose work is done by the external provider.
pub struct ProviderAgent {
    id: String,
    role: AgentRole,
    parent: Option<String>,
    specialization: Option<String>,
    provider: Arc<dyn AgentProvider>,
    skills: Vec<String>,
    retry: RetryPolicy,
}

impl ProviderAgent {
    pub fn new(
        id: impl Into<String>,
        role: AgentRole,
        provider: Arc<dyn AgentProvider>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            id: id.into(),
            role,
            parent: None,
            specialization: None,
            provider,
            skills: Vec::new(),
            retry,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_specialization(mut self, specialization: impl Into<String>) -> Self {
        self.specialization = Some(specialization.into());
        self
    }

    pub fn with_skills(mut self, skills: Vec<String>) -> Self {
        self.skills = skills;
        self
    }
}

#[async_trait]
impl Agent for ProviderAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn role(&self) -> AgentRole {
        self.role
    }

    fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    async fn execute(&self, mut task: TaskContext) -> Result<AgentResult, ForemanError> {
        task.instructions.insert(0, self.role.focus().to_string());
        let request = ProviderRequest {
            agent_id: self.id.clone(),
            role: self.role,
            specialization: self.specialization.clone(),
            task_context: task,
            available_skills: self.skills.clone(),
        };
        let response = invoke_with_retry(self.provider.as_ref(), request, &self.retry).await?;
        Ok(AgentResult {
            agent_id: self.id.clone(),
            output: response.result,
            artifacts: response.artifacts,
            usage: response.usage,
        })
    }
}
