//! Boundary to the external agent provider (the backend that does the work).

use std::ops::AddAssign;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::AgentRole;
use crate::breakdown::WorkNumber;
use crate::errors::ForemanError;
use crate::evidence::{SkipViolation, TestResults};

/// Token and cost usage reported by a provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.cost_usd += rhs.cost_usd;
    }
}

/// What an agent is asked to do.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub task_number: Option<WorkNumber>,
    pub title: String,
    pub description: String,
    /// Corrective feedback from earlier attempts, specialist advice.
    pub instructions: Vec<String>,
    /// Working-memory excerpts handed to the agent.
    pub context: Vec<String>,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub agent_id: String,
    pub role: AgentRole,
    pub specialization: Option<String>,
    pub task_context: TaskContext,
    pub available_skills: Vec<String>,
}

/// Structured output attached to a provider response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Artifact {
    TestReport(TestResults),
    SkipViolations { found: Vec<SkipViolation> },
    FileChanged { path: String },
    Note { text: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub result: String,
    pub artifacts: Vec<Artifact>,
    pub usage: Usage,
}

impl ProviderResponse {
    /// Latest test report among the artifacts.
    pub fn test_report(&self) -> Option<&TestResults> {
        self.artifacts.iter().rev().find_map(|a| match a {
            Artifact::TestReport(r) => Some(r),
            _ => None,
        })
    }

    pub fn skip_violations(&self) -> Vec<SkipViolation> {
        self.artifacts
            .iter()
            .filter_map(|a| match a {
                Artifact::SkipViolations { found } => Some(found.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

/// The external backend that performs code generation and review.
///
/// Treated as opaque: potentially slow and potentially failing.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    async fn invoke(&self, request: ProviderRequest) -> anyhow::Result<ProviderResponse>;
}

/// Retry and timeout policy around provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    pub timeout: Duration,
    /// Delay before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            timeout: Duration::from_secs(600),
            backoff: Duration::from_millis(500),
        }
    }
}

/// Invoke the provider, retrying failures and timeouts up to the budget.
pub async fn invoke_with_retry(
    provider: &dyn AgentProvider,
    request: ProviderRequest,
    policy: &RetryPolicy,
) -> Result<ProviderResponse, ForemanError> {
    let attempts = policy.retries + 1;
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        if attempt > 1 && !policy.backoff.is_zero() {
            tokio::time::sleep(policy.backoff * (attempt - 1)).await;
        }
        match tokio::time::timeout(policy.timeout, provider.invoke(request.clone())).await {
            Ok(Ok(response)) => return Ok(response),
            Ok(Err(e)) => last_error = format!("{e:#}"),
            Err(_) => last_error = format!("timed out after {:?}", policy.timeout),
        }
        tracing::warn!(
            agent_id = %request.agent_id,
            attempt,
            max_attempts = attempts,
            error = %last_error,
            "Provider call failed"
        );
    }

    Err(ForemanError::ProviderFailure {
        role: request.role.as_str().to_string(),
        attempts,
        message: last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl AgentProvider for Flaky {
        async fn invoke(&self, _request: ProviderRequest) -> anyhow::Result<ProviderResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                anyhow::bail!("backend unavailable");
            }
            Ok(ProviderResponse {
                result: "done".into(),
                ..Default::default()
            })
        }
    }

    struct Stalls;

    #[async_trait]
    impl AgentProvider for Stalls {
        async fn invoke(&self, _request: ProviderRequest) -> anyhow::Result<ProviderResponse> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ProviderResponse::default())
        }
    }

    fn request() -> ProviderRequest {
        ProviderRequest {
            agent_id: "backend-worker-001".into(),
            role: AgentRole::Backend,
            specialization: None,
            task_context: TaskContext::default(),
            available_skills: vec![],
        }
    }

    fn policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            timeout: Duration::from_millis(50),
            backoff: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_within_budget() {
        let provider = Flaky {
            failures_before_success: 2,
            calls: AtomicU32::new(0),
        };
        let response = invoke_with_retry(&provider, request(), &policy(2)).await.unwrap();
        assert_eq!(response.result, "done");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted_is_provider_failure() {
        let provider = Flaky {
            failures_before_success: 10,
            calls: AtomicU32::new(0),
        };
        let err = invoke_with_retry(&provider, request(), &policy(1)).await.unwrap_err();
        match err {
            ForemanError::ProviderFailure { role, attempts, message } => {
                assert_eq!(role, "backend");
                assert_eq!(attempts, 2);
                assert!(message.contains("backend unavailable"));
            }
            other => panic!("Expected ProviderFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let err = invoke_with_retry(&Stalls, request(), &policy(0)).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_response_artifact_accessors() {
        let response = ProviderResponse {
            result: "ok".into(),
            artifacts: vec![
                Artifact::TestReport(TestResults {
                    total: 1,
                    ..Default::default()
                }),
                Artifact::SkipViolations {
                    found: vec![SkipViolation {
                        file: "a.rs".into(),
                        line: 3,
                        pattern: "#[ignore]".into(),
                        context: None,
                    }],
                },
                Artifact::TestReport(TestResults {
                    total: 2,
                    ..Default::default()
                }),
            ],
            usage: Usage::default(),
        };
        assert_eq!(response.test_report().map(|r| r.total), Some(2));
        assert_eq!(response.skip_violations().len(), 1);
    }

    #[test]
    fn test_usage_accumulates() {
        let mut total = Usage::default();
        total += Usage {
            input_tokens: 10,
            output_tokens: 5,
            cost_usd: 0.25,
        };
        total += Usage {
            input_tokens: 1,
            output_tokens: 1,
            cost_usd: 0.25,
        };
        assert_eq!(total.input_tokens, 11);
        assert_eq!(total.output_tokens, 6);
        assert_eq!(total.cost_usd, 0.5);
    }
}
