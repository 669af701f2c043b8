//! Worker loop: one issue, its tasks strictly in sequence.
//!
//! A worker never writes the issue/task graph. It reports every step to the
//! lead over an mpsc channel and waits for a [`Directive`] in reply, so the
//! lead stays the single writer and task N's outcome is always recorded
//! before task N+1 starts.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use super::agent::{Agent, ProviderAgent};
use super::provider::{AgentProvider, RetryPolicy, TaskContext, Usage};
use super::AgentRole;
use crate::breakdown::{Issue, Task, WorkNumber, WorkStatus};
use crate::context::{ContextManager, ContextTier, ItemKind};
use crate::errors::ForemanError;
use crate::evidence::{EvidenceVerifier, TestResults, VerificationReport, VerificationRequest};

/// A whole issue handed to one worker.
#[derive(Debug, Clone)]
pub struct IssueAssignment {
    pub project_id: i64,
    pub worker_id: String,
    pub role: AgentRole,
    pub issue: Issue,
    /// Extra instructions for the first task run, e.g. a human's answer to a blocker.
    pub guidance: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed { evidence_id: i64 },
    Blocked { report: VerificationReport },
    Failed { reason: String },
}

#[derive(Debug)]
pub enum WorkerEvent {
    TaskStarted {
        worker: String,
        task: WorkNumber,
        attempt: u32,
    },
    TaskOutcome {
        worker: String,
        task: WorkNumber,
        outcome: TaskOutcome,
        usage: Usage,
    },
    SpawnSubagent {
        parent: String,
        specialization: String,
        reply: oneshot::Sender<Result<String, ForemanError>>,
    },
    SubagentFinished {
        id: String,
        retain: bool,
        usage: Usage,
    },
    /// The worker's context crossed the flash-save threshold.
    ContextPressure { worker: String },
    /// Pause observed; the task stays in progress.
    Interrupted { worker: String, task: WorkNumber },
    Finished { worker: String, issue: WorkNumber },
}

/// The lead's answer to a worker event.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Proceed,
    Retry { feedback: String },
    Escalate { specialization: String, feedback: String },
    AwaitHuman,
    Abort,
}

#[derive(Debug)]
pub struct WorkerMessage {
    pub event: WorkerEvent,
    pub ack: Option<oneshot::Sender<Directive>>,
}

/// Project-wide pause signal observed by workers at suspension points.
#[derive(Clone)]
pub struct PauseHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for PauseHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn pause(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

async fn paused(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|paused| *paused).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Shared services a worker needs.
#[derive(Clone)]
pub struct WorkerServices {
    pub provider: Arc<dyn AgentProvider>,
    pub verifier: Arc<EvidenceVerifier>,
    pub context: Arc<ContextManager>,
    pub retry: RetryPolicy,
    pub skills: Vec<String>,
    pub subagent_context_tokens: usize,
}

pub struct Worker {
    assignment: IssueAssignment,
    agent: ProviderAgent,
    services: WorkerServices,
    tx: mpsc::Sender<WorkerMessage>,
    pause: PauseHandle,
}

enum Step {
    Next,
    Stop,
}

impl Worker {
    pub fn new(
        assignment: IssueAssignment,
        services: WorkerServices,
        tx: mpsc::Sender<WorkerMessage>,
        pause: PauseHandle,
    ) -> Self {
        let agent = ProviderAgent::new(
            assignment.worker_id.clone(),
            assignment.role,
            services.provider.clone(),
            services.retry,
        )
        .with_skills(services.skills.clone());
        Self {
            assignment,
            agent,
            services,
            tx,
            pause,
        }
    }

    fn id(&self) -> &str {
        &self.assignment.worker_id
    }

    async fn send(&self, event: WorkerEvent) {
        // A closed channel means the lead is gone; nothing left to tell.
        let _ = self.tx.send(WorkerMessage { event, ack: None }).await;
    }

    /// Send an event and wait for the lead's directive. A lead that went
    /// away is treated as `Abort`.
    async fn request(&self, event: WorkerEvent) -> Directive {
        let (ack, rx) = oneshot::channel();
        if self
            .tx
            .send(WorkerMessage {
                event,
                ack: Some(ack),
            })
            .await
            .is_err()
        {
            return Directive::Abort;
        }
        rx.await.unwrap_or(Directive::Abort)
    }

    /// Execute the issue's remaining tasks in order.
    pub async fn run(self) -> Result<(), ForemanError> {
        let issue_number = self.assignment.issue.number.clone();
        tracing::info!(agent_id = %self.id(), issue = %issue_number, "Worker started");

        let tasks: Vec<Task> = self
            .assignment
            .issue
            .tasks
            .iter()
            .filter(|t| t.status != WorkStatus::Completed)
            .cloned()
            .collect();
        let mut guidance = self.assignment.guidance.clone();

        for task in tasks {
            match self.run_task(&task, std::mem::take(&mut guidance)).await? {
                Step::Next => {}
                Step::Stop => return Ok(()),
            }
        }

        self.send(WorkerEvent::Finished {
            worker: self.id().to_string(),
            issue: issue_number,
        })
        .await;
        Ok(())
    }

    async fn run_task(&self, task: &Task, mut instructions: Vec<String>) -> Result<Step, ForemanError> {
        let worker = self.id().to_string();
        let context = &self.services.context;
        let spec = format!("Task {}: {}\n{}", task.number, task.title, task.description);
        let mut spec_item = context.add_item(&worker, ItemKind::TaskSpec, spec.clone());
        let mut attempt = task.attempts;

        loop {
            attempt += 1;
            if self.pause.is_paused() {
                return self.interrupted(task).await;
            }

            let started = self
                .request(WorkerEvent::TaskStarted {
                    worker: worker.clone(),
                    task: task.number.clone(),
                    attempt,
                })
                .await;
            if started != Directive::Proceed {
                return Ok(Step::Stop);
            }

            if context.reference(&worker, spec_item).is_err() {
                // Archived by a flash save since the last attempt.
                spec_item = context.add_item(&worker, ItemKind::TaskSpec, spec.clone());
            }
            let task_context = TaskContext {
                task_number: Some(task.number.clone()),
                title: task.title.clone(),
                description: task.description.clone(),
                instructions: instructions.clone(),
                context: context
                    .live_items(&worker)
                    .into_iter()
                    .filter(|item| item.tier != ContextTier::Cold)
                    .map(|item| item.content)
                    .collect(),
                attempt,
            };

            let result = tokio::select! {
                result = self.agent.execute(task_context) => result,
                _ = paused(self.pause.subscribe()) => return self.interrupted(task).await,
            };
            if self.pause.is_paused() {
                return self.interrupted(task).await;
            }

            context.end_turn(&worker);
            if context.should_flash_save(&worker)
                && self
                    .request(WorkerEvent::ContextPressure {
                        worker: worker.clone(),
                    })
                    .await
                    == Directive::Abort
            {
                return Ok(Step::Stop);
            }

            let (outcome, usage) = match result {
                Ok(result) => {
                    context.add_item(&worker, ItemKind::ToolResult, result.output.clone());
                    let mut results = TestResults::default();
                    let mut skips = Vec::new();
                    for artifact in &result.artifacts {
                        match artifact {
                            super::Artifact::TestReport(r) => results = r.clone(),
                            super::Artifact::SkipViolations { found } => {
                                skips.extend(found.iter().cloned())
                            }
                            _ => {}
                        }
                    }
                    let report = self
                        .services
                        .verifier
                        .verify(VerificationRequest {
                            project_id: self.assignment.project_id,
                            task_id: task.id,
                            task_number: task.number.clone(),
                            agent_id: Some(worker.clone()),
                            attempt,
                            results,
                            skip_violations: skips,
                        })
                        .await?;
                    context.add_item(&worker, ItemKind::TestResult, report.reason());
                    let outcome = if report.passed {
                        TaskOutcome::Completed {
                            evidence_id: report.record_id,
                        }
                    } else {
                        TaskOutcome::Blocked { report }
                    };
                    (outcome, result.usage)
                }
                Err(e) => (
                    TaskOutcome::Failed {
                        reason: e.to_string(),
                    },
                    Usage::default(),
                ),
            };

            let directive = self
                .request(WorkerEvent::TaskOutcome {
                    worker: worker.clone(),
                    task: task.number.clone(),
                    outcome,
                    usage,
                })
                .await;
            match directive {
                Directive::Proceed => return Ok(Step::Next),
                Directive::Retry { feedback } => instructions.push(feedback),
                Directive::Escalate {
                    specialization,
                    feedback,
                } => {
                    if let Some(advice) = self.consult(task, &specialization, &feedback).await {
                        instructions.push(advice);
                    }
                    instructions.push(feedback);
                }
                Directive::AwaitHuman | Directive::Abort => return Ok(Step::Stop),
            }
        }
    }

    async fn interrupted(&self, task: &Task) -> Result<Step, ForemanError> {
        tracing::info!(agent_id = %self.id(), task = %task.number, "Pause observed, stopping");
        self.send(WorkerEvent::Interrupted {
            worker: self.id().to_string(),
            task: task.number.clone(),
        })
        .await;
        Ok(Step::Stop)
    }

    /// Ask a specialist subagent for help with a blocked task.
    ///
    /// The subagent receives a bounded slice of this worker's context and
    /// reports only to this worker. `None` when it could not be spawned or
    /// failed.
    async fn consult(&self, task: &Task, specialization: &str, problem: &str) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerEvent::SpawnSubagent {
            parent: self.id().to_string(),
            specialization: specialization.to_string(),
            reply,
        })
        .await;
        let sub_id = match rx.await {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                tracing::warn!(agent_id = %self.id(), error = %e, "Subagent spawn refused");
                return None;
            }
            Err(_) => return None,
        };

        let mut budget = self.services.subagent_context_tokens;
        let mut payload = Vec::new();
        for item in self.services.context.live_items(self.id()) {
            if item.tokens > budget {
                break;
            }
            budget -= item.tokens;
            payload.push(item.content);
        }

        let subagent = ProviderAgent::new(
            sub_id.clone(),
            AgentRole::Specialist,
            self.services.provider.clone(),
            self.services.retry,
        )
        .with_parent(self.id())
        .with_specialization(specialization)
        .with_skills(self.services.skills.clone());

        let result = subagent
            .execute(TaskContext {
                task_number: Some(task.number.clone()),
                title: format!("Unblock task {}: {}", task.number, task.title),
                description: problem.to_string(),
                instructions: Vec::new(),
                context: payload,
                attempt: 1,
            })
            .await;

        let (advice, usage) = match result {
            Ok(result) => {
                let report = subagent.report(result);
                (
                    Some(format!("Advice from {}: {}", report.agent_id, report.result.output)),
                    report.result.usage,
                )
            }
            Err(e) => {
                tracing::warn!(agent_id = %sub_id, error = %e, "Subagent failed");
                (None, Usage::default())
            }
        };
        self.send(WorkerEvent::SubagentFinished {
            id: sub_id,
            retain: false,
            usage,
        })
        .await;
        advice
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{Artifact, ProviderRequest, ProviderResponse};
    use crate::breakdown::{FeatureSpec, TaskSpec, WorkBreakdown};
    use crate::context::{FlashSaveConfig, TierPolicy};
    use crate::evidence::EvidencePolicy;
    use crate::store::DbHandle;
    use async_trait::async_trait;
    use std::time::Duration;

    struct AlwaysGreen;

    #[async_trait]
    impl AgentProvider for AlwaysGreen {
        async fn invoke(&self, _request: ProviderRequest) -> anyhow::Result<ProviderResponse> {
            Ok(ProviderResponse {
                result: "implemented".into(),
                artifacts: vec![Artifact::TestReport(TestResults {
                    total: 4,
                    passed: 4,
                    coverage: Some(95.0),
                    output: "test result: ok. 4 passed".into(),
                    ..Default::default()
                })],
                usage: Usage::default(),
            })
        }
    }

    fn setup() -> (Worker, mpsc::Receiver<WorkerMessage>, PauseHandle) {
        let db = DbHandle::in_memory().unwrap();
        let wb = WorkBreakdown::from_features(
            1,
            vec![FeatureSpec {
                title: "Auth".into(),
                tasks: vec![TaskSpec::new("schema", ""), TaskSpec::new("endpoint", "")],
                ..Default::default()
            }],
        )
        .unwrap();
        let services = WorkerServices {
            provider: Arc::new(AlwaysGreen),
            verifier: Arc::new(EvidenceVerifier::new(EvidencePolicy::default(), db.clone())),
            context: Arc::new(ContextManager::new(
                1,
                db,
                TierPolicy::default(),
                FlashSaveConfig::default(),
            )),
            retry: RetryPolicy {
                retries: 0,
                timeout: Duration::from_secs(5),
                backoff: Duration::ZERO,
            },
            skills: vec![],
            subagent_context_tokens: 100,
        };
        let (tx, rx) = mpsc::channel(8);
        let pause = PauseHandle::new();
        let worker = Worker::new(
            IssueAssignment {
                project_id: 1,
                worker_id: "backend-worker-001".into(),
                role: AgentRole::Backend,
                issue: wb.issues()[0].clone(),
                guidance: vec![],
            },
            services,
            tx,
            pause.clone(),
        );
        (worker, rx, pause)
    }

    #[tokio::test]
    async fn test_worker_reports_each_task_in_order() {
        let (worker, mut rx, _pause) = setup();
        let handle = tokio::spawn(worker.run());

        let mut seen = Vec::new();
        while let Some(msg) = rx.recv().await {
            match &msg.event {
                WorkerEvent::TaskStarted { task, .. } => seen.push(format!("start {task}")),
                WorkerEvent::TaskOutcome { task, outcome, .. } => {
                    assert!(matches!(outcome, TaskOutcome::Completed { .. }));
                    seen.push(format!("done {task}"));
                }
                WorkerEvent::Finished { issue, .. } => seen.push(format!("finished {issue}")),
                other => panic!("unexpected event {other:?}"),
            }
            if let Some(ack) = msg.ack {
                ack.send(Directive::Proceed).unwrap();
            }
        }
        handle.await.unwrap().unwrap();
        assert_eq!(
            seen,
            vec!["start 1.1.1", "done 1.1.1", "start 1.1.2", "done 1.1.2", "finished 1.1"]
        );
    }

    #[tokio::test]
    async fn test_paused_worker_interrupts_before_starting() {
        let (worker, mut rx, pause) = setup();
        pause.pause();
        worker.run().await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg.event, WorkerEvent::Interrupted { ref task, .. } if task.to_string() == "1.1.1"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_abort_directive_stops_worker() {
        let (worker, mut rx, _pause) = setup();
        let handle = tokio::spawn(worker.run());
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg.event, WorkerEvent::TaskStarted { .. }));
        msg.ack.unwrap().send(Directive::Abort).unwrap();
        handle.await.unwrap().unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_pause_handle_without_receivers() {
        let pause = PauseHandle::new();
        pause.pause();
        assert!(pause.is_paused());
        pause.clear();
        assert!(!pause.is_paused());
    }
}
