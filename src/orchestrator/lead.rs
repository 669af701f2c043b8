use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use uuid::Uuid;

use super::OrchestratorConfig;
use super::transitions::{check_issue, check_task};
use crate::agents::{
    AgentProvider, AgentRegistry, AgentRole, AgentState, Directive, IssueAssignment, PauseHandle,
    TaskOutcome, Usage, Worker, WorkerEvent, WorkerMessage, WorkerServices,
};
use crate::breakdown::{FeatureSpec, Task, TaskSpec, WorkBreakdown, WorkNumber, WorkStatus};
use crate::checkpoint::{CheckpointManager, CheckpointTrigger};
use crate::context::ContextManager;
use crate::errors::ForemanError;
use crate::events::{EventBus, EventType};
use crate::evidence::{EvidenceVerifier, VerificationReport};
use crate::lifecycle::ProjectStatus;
use crate::store::{Blocker, DbHandle};

/// Collaborators the lead drives.
#[derive(Clone)]
pub struct LeadServices {
    pub provider: Arc<dyn AgentProvider>,
    pub verifier: Arc<EvidenceVerifier>,
    pub context: Arc<ContextManager>,
    pub checkpoints: Arc<CheckpointManager>,
    pub events: EventBus,
    pub pause: PauseHandle,
}

/// Counters for one [`LeadOrchestrator::run`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub tasks_completed: usize,
    pub tasks_blocked: usize,
    pub tasks_failed: usize,
    pub issues_completed: usize,
    pub issues_failed: usize,
    pub retries: usize,
    pub escalations: usize,
    pub blockers_opened: usize,
    pub interrupted: usize,
    pub dependency_rejections: usize,
    pub flash_saves: usize,
    pub usage: Usage,
    /// The run ended because the project was paused.
    pub paused: bool,
}

/// Single writer of the issue/task graph and the agent registry.
pub struct LeadOrchestrator {
    project_id: i64,
    db: DbHandle,
    config: OrchestratorConfig,
    services: LeadServices,
    breakdown: WorkBreakdown,
    registry: AgentRegistry,
    /// Corrective retries spent per task.
    retries: HashMap<Uuid, u32>,
    escalated: HashSet<Uuid>,
    awaiting_human: HashSet<Uuid>,
    /// Instructions for the next run of a task, e.g. a blocker answer.
    guidance: HashMap<Uuid, Vec<String>>,
    /// Worker id -> issue it is executing.
    running: HashMap<String, WorkNumber>,
}

impl LeadOrchestrator {
    /// Load the persisted graph and open blockers for `project_id`.
    pub async fn load(
        project_id: i64,
        db: DbHandle,
        config: OrchestratorConfig,
        services: LeadServices,
    ) -> Result<Self, ForemanError> {
        let (breakdown, blockers) = db
            .persist(move |db| {
                Ok((
                    db.load_breakdown(project_id)?,
                    db.list_blockers(project_id, false)?,
                ))
            })
            .await?;

        let mut lead = Self {
            project_id,
            db,
            registry: AgentRegistry::new(config.max_agents),
            config,
            services,
            breakdown,
            retries: HashMap::new(),
            escalated: HashSet::new(),
            awaiting_human: HashSet::new(),
            guidance: HashMap::new(),
            running: HashMap::new(),
        };
        for blocker in blockers {
            lead.adopt_blocker(blocker);
        }
        Ok(lead)
    }

    fn adopt_blocker(&mut self, blocker: Blocker) {
        let still_blocked = self
            .breakdown
            .task(&blocker.task_number)
            .is_some_and(|t| t.id == blocker.task_id && t.status == WorkStatus::Blocked);
        if !still_blocked {
            return;
        }
        match blocker.answer {
            None => {
                self.awaiting_human.insert(blocker.task_id);
            }
            Some(answer) => {
                self.guidance
                    .entry(blocker.task_id)
                    .or_default()
                    .push(format!("Answer to blocker #{}: {answer}", blocker.id));
            }
        }
    }

    pub fn breakdown(&self) -> &WorkBreakdown {
        &self.breakdown
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Tasks parked until a human answers their blocker.
    pub fn awaiting_human(&self) -> usize {
        self.awaiting_human.len()
    }

    /// Decompose features into issues and their task chains.
    ///
    /// Only an empty project can be planned; the graph is persisted before it
    /// replaces the in-memory one.
    pub async fn plan(&mut self, features: Vec<FeatureSpec>) -> Result<&WorkBreakdown, ForemanError> {
        if !self.breakdown.is_empty() {
            return Err(ForemanError::validation(format!(
                "project {} already has a work breakdown",
                self.project_id
            )));
        }
        let planned = WorkBreakdown::from_features(self.breakdown.scope(), features)?;
        planned.validate()?;
        self.commit_breakdown(planned).await?;
        let (_, total) = self.breakdown.task_counts();
        tracing::info!(
            project_id = self.project_id,
            issues = self.breakdown.issues().len(),
            tasks = total,
            "Work breakdown planned"
        );
        Ok(&self.breakdown)
    }

    /// Insert a task into an issue, renumbering its later siblings.
    pub async fn insert_task(
        &mut self,
        issue: &WorkNumber,
        position: u32,
        spec: TaskSpec,
    ) -> Result<WorkNumber, ForemanError> {
        if self.running.values().any(|running| running == issue) {
            return Err(ForemanError::validation(format!(
                "issue {issue} is being executed and cannot be restructured"
            )));
        }
        let mut updated = self.breakdown.clone();
        let number = updated.insert_task(issue, position, spec)?;
        updated.validate()?;
        self.commit_breakdown(updated).await?;
        Ok(number)
    }

    async fn commit_breakdown(&mut self, breakdown: WorkBreakdown) -> Result<(), ForemanError> {
        let project_id = self.project_id;
        let row = breakdown.clone();
        self.db
            .persist(move |db| db.save_breakdown(project_id, &row))
            .await?;
        self.breakdown = breakdown;
        Ok(())
    }

    /// Readiness check before a task enters `in_progress`.
    pub fn ensure_ready(&self, task: &WorkNumber) -> Result<(), ForemanError> {
        let missing = self.breakdown.unmet_dependencies(task)?;
        if missing.is_empty() {
            return Ok(());
        }
        Err(ForemanError::DependencyNotSatisfied {
            task: task.to_string(),
            missing: missing.iter().map(ToString::to_string).collect(),
        })
    }

    /// Record a human's answer; the blocked task becomes dispatchable again
    /// with the answer as guidance and a fresh retry budget.
    pub async fn resolve_blocker(&mut self, blocker_id: i64, answer: &str) -> Result<Blocker, ForemanError> {
        let owned = answer.to_string();
        let blocker = self
            .db
            .persist(move |db| db.resolve_blocker(blocker_id, &owned))
            .await?;
        self.awaiting_human.remove(&blocker.task_id);
        self.retries.remove(&blocker.task_id);
        self.escalated.remove(&blocker.task_id);
        self.adopt_blocker(blocker.clone());
        tracing::info!(
            project_id = self.project_id,
            blocker_id,
            task = %blocker.task_number,
            "Blocker resolved"
        );
        Ok(blocker)
    }

    /// Stored lifecycle status. The pause signal only covers this process;
    /// the database is what another process pauses or stops.
    async fn stored_status(&self) -> Result<ProjectStatus, ForemanError> {
        let project_id = self.project_id;
        self.db
            .persist(move |db| db.get_project(project_id))
            .await?
            .map(|p| p.status)
            .ok_or_else(|| ForemanError::not_found("project", project_id))
    }

    /// Execute every dispatchable issue until the graph is exhausted, the
    /// project is paused, or a persistence failure stops the run.
    ///
    /// Fails with [`ForemanError::NotActive`] unless the stored status is
    /// `active`.
    pub async fn run(&mut self) -> Result<RunSummary, ForemanError> {
        let status = self.stored_status().await?;
        if status != ProjectStatus::Active {
            return Err(ForemanError::NotActive {
                project_id: self.project_id,
                status: status.to_string(),
            });
        }

        let (tx, mut rx) = mpsc::channel::<WorkerMessage>(64);
        let mut workers: JoinSet<(String, Result<(), ForemanError>)> = JoinSet::new();
        let mut summary = RunSummary::default();
        let mut fatal: Option<ForemanError> = None;

        tracing::info!(project_id = self.project_id, "Run started");
        loop {
            if fatal.is_none()
                && !self.services.pause.is_paused()
                && let Err(e) = self.dispatch(&tx, &mut workers).await
            {
                tracing::error!(project_id = self.project_id, error = %e, "Dispatch failed");
                fatal = Some(e);
            }
            if workers.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                Some(message) = rx.recv() => {
                    self.on_message(message, &mut summary, &mut fatal).await;
                }
                Some(joined) = workers.join_next() => {
                    match joined {
                        Ok((worker, result)) => {
                            self.on_worker_exit(&worker);
                            if let Err(e) = result {
                                tracing::error!(agent_id = %worker, error = %e, "Worker failed");
                                fatal.get_or_insert(e);
                            }
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Worker task panicked");
                            fatal.get_or_insert(ForemanError::validation(format!(
                                "worker task aborted: {e}"
                            )));
                        }
                    }
                }
                else => break,
            }
        }

        // Messages sent right before a worker exited.
        while let Ok(message) = rx.try_recv() {
            self.on_message(message, &mut summary, &mut fatal).await;
        }

        summary.paused = self.services.pause.is_paused();
        match fatal {
            Some(e) => Err(e),
            None => {
                tracing::info!(
                    project_id = self.project_id,
                    completed = summary.tasks_completed,
                    blocked = summary.tasks_blocked,
                    failed = summary.tasks_failed,
                    paused = summary.paused,
                    "Run finished"
                );
                Ok(summary)
            }
        }
    }

    /// Assign ready issues to workers, up to `max_workers`.
    async fn dispatch(
        &mut self,
        tx: &mpsc::Sender<WorkerMessage>,
        workers: &mut JoinSet<(String, Result<(), ForemanError>)>,
    ) -> Result<(), ForemanError> {
        let mut candidates: Vec<(WorkNumber, Task)> = Vec::new();
        for issue in self.breakdown.dispatchable_issues() {
            if self.running.values().any(|n| n == &issue.number) {
                continue;
            }
            let Some(next) = issue.next_task() else {
                continue;
            };
            if next.status == WorkStatus::Failed || self.awaiting_human.contains(&next.id) {
                continue;
            }
            if !self.breakdown.is_ready(&next.number)? {
                continue;
            }
            candidates.push((issue.number.clone(), next.clone()));
        }
        candidates.sort_by(|(a, _), (b, _)| {
            let pa = self.breakdown.issue(a).map(|i| i.priority);
            let pb = self.breakdown.issue(b).map(|i| i.priority);
            pa.cmp(&pb).then_with(|| a.cmp(b))
        });
        if candidates.is_empty() || self.running.len() >= self.config.max_workers {
            return Ok(());
        }

        let status = self.stored_status().await?;
        if status != ProjectStatus::Active {
            // Paused or stopped elsewhere: halt local workers too.
            tracing::info!(
                project_id = self.project_id,
                status = %status,
                "Project no longer active, dispatch halted"
            );
            self.services.pause.pause();
            return Ok(());
        }

        for (issue_number, next) in candidates {
            if self.running.len() >= self.config.max_workers {
                break;
            }
            let Some(issue) = self.breakdown.issue(&issue_number) else {
                continue;
            };
            let role = AgentRole::for_text(&format!("{} {}", issue.title, issue.description));

            // A blocked task keeps its worker.
            let kept = next.assigned_agent.clone().filter(|id| {
                next.status == WorkStatus::Blocked
                    && self
                        .registry
                        .get(id)
                        .is_some_and(|a| a.state == AgentState::Blocked && !self.running.contains_key(id))
            });
            let worker_id = match kept {
                Some(id) => id,
                None => match self.registry.acquire_worker(role) {
                    Ok(id) => id,
                    Err(e) => {
                        tracing::debug!(issue = %issue_number, error = %e, "No worker available");
                        break;
                    }
                },
            };
            self.registry.assign(&worker_id, &next.number)?;
            self.registry.mark_busy(&worker_id)?;

            if issue.status == WorkStatus::Pending {
                self.set_issue_status(&issue_number, WorkStatus::InProgress).await?;
            }
            let Some(issue) = self.breakdown.issue(&issue_number).cloned() else {
                continue;
            };

            let assignment = IssueAssignment {
                project_id: self.project_id,
                worker_id: worker_id.clone(),
                role,
                issue,
                guidance: self.guidance.remove(&next.id).unwrap_or_default(),
            };
            let worker = Worker::new(assignment, self.worker_services(), tx.clone(), self.services.pause.clone());
            self.running.insert(worker_id.clone(), issue_number.clone());
            tracing::info!(
                project_id = self.project_id,
                issue = %issue_number,
                agent_id = %worker_id,
                "Issue dispatched"
            );
            workers.spawn(async move {
                let result = worker.run().await;
                (worker_id, result)
            });
        }
        Ok(())
    }

    fn worker_services(&self) -> WorkerServices {
        WorkerServices {
            provider: self.services.provider.clone(),
            verifier: self.services.verifier.clone(),
            context: self.services.context.clone(),
            retry: self.config.retry_policy(),
            skills: self.config.skills.clone(),
            subagent_context_tokens: self.config.subagent_context_tokens,
        }
    }

    fn on_worker_exit(&mut self, worker: &str) {
        self.running.remove(worker);
        let blocked = self
            .registry
            .get(worker)
            .is_some_and(|a| a.state == AgentState::Blocked);
        if !blocked && let Err(e) = self.registry.release(worker) {
            tracing::warn!(agent_id = %worker, error = %e, "Failed to release worker");
        }
    }

    async fn on_message(
        &mut self,
        message: WorkerMessage,
        summary: &mut RunSummary,
        fatal: &mut Option<ForemanError>,
    ) {
        let WorkerMessage { event, ack } = message;
        if fatal.is_some() {
            // Stop every worker at its next request.
            if let Some(ack) = ack {
                let _ = ack.send(Directive::Abort);
            }
            self.on_passive(event, summary);
            return;
        }
        match self.handle(event, summary).await {
            Ok(directive) => {
                if let Some(ack) = ack {
                    let _ = ack.send(directive);
                }
            }
            Err(e) => {
                tracing::error!(project_id = self.project_id, error = %e, "Lead stopped on error");
                // Dropping the ack reads as Abort on the worker side.
                *fatal = Some(e);
            }
        }
    }

    /// Bookkeeping that stays valid after a fatal error.
    fn on_passive(&mut self, event: WorkerEvent, summary: &mut RunSummary) {
        match event {
            WorkerEvent::SpawnSubagent { reply, .. } => {
                let _ = reply.send(Err(ForemanError::validation("run is stopping")));
            }
            WorkerEvent::SubagentFinished { id, .. } => {
                let _ = self.registry.terminate(&id);
            }
            WorkerEvent::Interrupted { .. } => summary.interrupted += 1,
            _ => {}
        }
    }

    async fn handle(&mut self, event: WorkerEvent, summary: &mut RunSummary) -> Result<Directive, ForemanError> {
        match event {
            WorkerEvent::TaskStarted {
                worker,
                task,
                attempt,
            } => self.on_task_started(&worker, &task, attempt, summary).await,
            WorkerEvent::TaskOutcome {
                worker,
                task,
                outcome,
                usage,
            } => {
                self.record_usage(usage, summary).await?;
                match outcome {
                    TaskOutcome::Completed { evidence_id } => {
                        self.on_completed(&worker, &task, evidence_id, summary).await
                    }
                    TaskOutcome::Blocked { report } => {
                        self.on_blocked(&worker, &task, &report, summary).await
                    }
                    TaskOutcome::Failed { reason } => {
                        self.on_failed(&worker, &task, &reason, summary).await
                    }
                }
            }
            WorkerEvent::ContextPressure { worker } => {
                self.on_context_pressure(&worker, summary).await?;
                Ok(Directive::Proceed)
            }
            WorkerEvent::SpawnSubagent {
                parent,
                specialization,
                reply,
            } => {
                let result = self.registry.spawn_subagent(&parent, &specialization);
                if let Ok(id) = &result {
                    self.services.events.emit(
                        EventType::AgentSpawned,
                        self.project_id,
                        json!({ "agent_id": id, "parent": parent, "specialization": specialization }),
                    );
                }
                let _ = reply.send(result);
                Ok(Directive::Proceed)
            }
            WorkerEvent::SubagentFinished { id, retain, usage } => {
                self.record_usage(usage, summary).await?;
                if retain {
                    self.registry.retain(&id)?;
                } else {
                    let terminated = self.registry.terminate(&id)?;
                    self.services.events.emit(
                        EventType::AgentTerminated,
                        self.project_id,
                        json!({ "agents": terminated }),
                    );
                }
                Ok(Directive::Proceed)
            }
            WorkerEvent::Interrupted { worker, task } => {
                summary.interrupted += 1;
                tracing::info!(agent_id = %worker, task = %task, "Task interrupted by pause");
                Ok(Directive::Proceed)
            }
            WorkerEvent::Finished { worker, issue } => {
                tracing::debug!(agent_id = %worker, issue = %issue, "Worker finished issue");
                Ok(Directive::Proceed)
            }
        }
    }

    fn task(&self, number: &WorkNumber) -> Result<&Task, ForemanError> {
        self.breakdown
            .task(number)
            .ok_or_else(|| ForemanError::not_found("task", number))
    }

    /// Persist a task, then adopt it in memory.
    async fn save_task(&mut self, task: Task) -> Result<(), ForemanError> {
        let row = task.clone();
        self.db.persist(move |db| db.save_task(&row)).await?;
        if let Some(slot) = self.breakdown.task_mut(&task.number) {
            *slot = task;
        }
        Ok(())
    }

    async fn set_issue_status(&mut self, number: &WorkNumber, next: WorkStatus) -> Result<(), ForemanError> {
        let issue = self
            .breakdown
            .issue(number)
            .ok_or_else(|| ForemanError::not_found("issue", number))?;
        check_issue(issue.status, next)?;
        let mut updated = issue.clone();
        updated.status = next;
        if next == WorkStatus::Completed {
            updated.completed_at = Some(Utc::now());
        }
        let completed_at = updated.completed_at;
        self.db
            .persist(move |db| db.save_issue_status(&updated))
            .await?;
        if let Some(slot) = self.breakdown.issue_mut(number) {
            slot.status = next;
            slot.completed_at = completed_at;
        }
        Ok(())
    }

    async fn record_usage(&mut self, usage: Usage, summary: &mut RunSummary) -> Result<(), ForemanError> {
        if usage == Usage::default() {
            return Ok(());
        }
        let project_id = self.project_id;
        self.db
            .persist(move |db| db.add_usage(project_id, &usage))
            .await?;
        summary.usage += usage;
        Ok(())
    }

    async fn on_task_started(
        &mut self,
        worker: &str,
        number: &WorkNumber,
        attempt: u32,
        summary: &mut RunSummary,
    ) -> Result<Directive, ForemanError> {
        let status = self.stored_status().await?;
        if status != ProjectStatus::Active {
            tracing::info!(
                agent_id = %worker,
                task = %number,
                status = %status,
                "Task start refused, project not active"
            );
            return Ok(Directive::Abort);
        }
        if let Err(e) = self.ensure_ready(number) {
            summary.dependency_rejections += 1;
            tracing::warn!(agent_id = %worker, task = %number, error = %e, "Task start rejected");
            return Ok(Directive::Abort);
        }
        let current = self.task(number)?;
        if let Err(e) = check_task(current.status, WorkStatus::InProgress) {
            tracing::warn!(agent_id = %worker, task = %number, error = %e, "Task start rejected");
            return Ok(Directive::Abort);
        }

        let mut task = current.clone();
        task.status = WorkStatus::InProgress;
        task.attempts = attempt;
        task.assigned_agent = Some(worker.to_string());
        task.started_at.get_or_insert_with(Utc::now);
        self.save_task(task).await?;
        self.registry.mark_busy(worker)?;

        self.services.events.emit(
            EventType::TaskStarted,
            self.project_id,
            json!({ "task": number.to_string(), "agent_id": worker, "attempt": attempt }),
        );
        Ok(Directive::Proceed)
    }

    async fn on_completed(
        &mut self,
        worker: &str,
        number: &WorkNumber,
        evidence_id: i64,
        summary: &mut RunSummary,
    ) -> Result<Directive, ForemanError> {
        let current = self.task(number)?;
        check_task(current.status, WorkStatus::Completed)?;
        let mut task = current.clone();
        let task_id = task.id;
        task.status = WorkStatus::Completed;
        task.completed_at = Some(Utc::now());
        task.reason = None;
        task.violations.clear();
        self.save_task(task).await?;

        self.registry.complete_task(worker)?;
        self.retries.remove(&task_id);
        self.escalated.remove(&task_id);
        summary.tasks_completed += 1;
        tracing::info!(agent_id = %worker, task = %number, evidence_id, "Task completed");
        self.services.events.emit(
            EventType::TaskCompleted,
            self.project_id,
            json!({ "task": number.to_string(), "agent_id": worker, "evidence_id": evidence_id }),
        );

        let issue = self.breakdown.parent_issue(number)?;
        if issue.all_tasks_completed() {
            let issue_number = issue.number.clone();
            self.set_issue_status(&issue_number, WorkStatus::Completed).await?;
            summary.issues_completed += 1;
            tracing::info!(issue = %issue_number, "Issue completed");
            self.services.events.emit(
                EventType::IssueCompleted,
                self.project_id,
                json!({ "issue": issue_number.to_string() }),
            );
        }
        Ok(Directive::Proceed)
    }

    async fn on_blocked(
        &mut self,
        worker: &str,
        number: &WorkNumber,
        report: &VerificationReport,
        summary: &mut RunSummary,
    ) -> Result<Directive, ForemanError> {
        let current = self.task(number)?;
        check_task(current.status, WorkStatus::Blocked)?;
        let mut task = current.clone();
        task.status = WorkStatus::Blocked;
        task.reason = Some(report.reason());
        task.violations = report.thresholds();
        let blocked = task.clone();
        self.save_task(task).await?;
        self.registry.mark_blocked(worker)?;
        summary.tasks_blocked += 1;

        let spent = self.retries.get(&blocked.id).copied().unwrap_or(0);
        let feedback = format!(
            "Verification rejected task {number}: {}. Fix every listed violation.",
            report.reason()
        );
        let directive = if spent < self.config.task_retry_budget {
            self.retries.insert(blocked.id, spent + 1);
            summary.retries += 1;
            Directive::Retry { feedback }
        } else if self.escalated.insert(blocked.id) {
            summary.escalations += 1;
            Directive::Escalate {
                specialization: specialization_for(&blocked.violations).to_string(),
                feedback,
            }
        } else {
            let question = format!(
                "Task {number} ({}) is still blocked after {spent} corrective retries and specialist help: {}. How should it proceed?",
                blocked.title,
                report.reason()
            );
            let project_id = self.project_id;
            let row = blocked.clone();
            let blocker = self
                .db
                .persist(move |db| db.create_blocker(project_id, &row, &question))
                .await?;
            self.awaiting_human.insert(blocked.id);
            summary.blockers_opened += 1;
            tracing::warn!(task = %number, blocker_id = blocker.id, "Task escalated to a human");
            Directive::AwaitHuman
        };

        tracing::warn!(
            agent_id = %worker,
            task = %number,
            violations = ?blocked.violations,
            "Task blocked by evidence gate"
        );
        self.services.events.emit(
            EventType::TaskBlocked,
            self.project_id,
            json!({
                "task": number.to_string(),
                "agent_id": worker,
                "reason": blocked.reason,
                "violations": blocked.violations,
                "awaiting_human": directive == Directive::AwaitHuman,
            }),
        );
        Ok(directive)
    }

    async fn on_failed(
        &mut self,
        worker: &str,
        number: &WorkNumber,
        reason: &str,
        summary: &mut RunSummary,
    ) -> Result<Directive, ForemanError> {
        let current = self.task(number)?;
        let mut task = current.clone();
        let spent = self.retries.get(&task.id).copied().unwrap_or(0);

        if spent < self.config.task_retry_budget {
            // Stays in progress; the worker tries again.
            task.reason = Some(reason.to_string());
            let task_id = task.id;
            self.save_task(task).await?;
            self.retries.insert(task_id, spent + 1);
            summary.retries += 1;
            tracing::warn!(agent_id = %worker, task = %number, reason, "Task attempt failed, retrying");
            return Ok(Directive::Retry {
                feedback: format!("The previous attempt failed: {reason}"),
            });
        }

        check_task(task.status, WorkStatus::Failed)?;
        task.status = WorkStatus::Failed;
        task.reason = Some(format!("failed after {} attempt(s): {reason}", task.attempts));
        let failed_reason = task.reason.clone();
        self.save_task(task).await?;
        summary.tasks_failed += 1;
        tracing::error!(agent_id = %worker, task = %number, reason, "Task failed");
        self.services.events.emit(
            EventType::TaskFailed,
            self.project_id,
            json!({ "task": number.to_string(), "agent_id": worker, "reason": failed_reason }),
        );

        let issue_number = self.breakdown.parent_issue(number)?.number.clone();
        self.set_issue_status(&issue_number, WorkStatus::Failed).await?;
        summary.issues_failed += 1;
        self.services.events.emit(
            EventType::IssueFailed,
            self.project_id,
            json!({ "issue": issue_number.to_string(), "task": number.to_string() }),
        );
        Ok(Directive::Abort)
    }

    /// Checkpoint, then archive the worker's cold context.
    async fn on_context_pressure(&mut self, worker: &str, summary: &mut RunSummary) -> Result<(), ForemanError> {
        let snapshot = self.services.context.snapshot();
        let checkpoint = self
            .services
            .checkpoints
            .create(
                CheckpointTrigger::PreCompaction,
                &snapshot,
                self.registry.active_agents(),
                Some(format!("context pressure from {worker}")),
            )
            .await?;
        self.services.events.emit(
            EventType::CheckpointCreated,
            self.project_id,
            json!({ "checkpoint_id": checkpoint.id, "trigger": checkpoint.trigger.as_str() }),
        );

        let saved = self.services.context.flash_save(worker).await?;
        summary.flash_saves += 1;
        self.services.events.emit(
            EventType::FlashSaveCompleted,
            self.project_id,
            json!({
                "agent_id": worker,
                "tokens_before": saved.tokens_before,
                "tokens_after": saved.tokens_after,
                "reduction_percentage": saved.reduction_percentage,
                "items_archived": saved.items_archived,
            }),
        );
        Ok(())
    }
}

/// Specialist to consult for a set of violated thresholds.
fn specialization_for(violations: &[String]) -> &'static str {
    let has = |name: &str| violations.iter().any(|v| v == name);
    if has("tests_failed") || has("pass_rate") {
        "test-debugging"
    } else if has("coverage") || has("coverage_missing") {
        "test-coverage"
    } else if has("skipped_tests") || has("skip_patterns") {
        "test-hygiene"
    } else {
        "quality"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{Artifact, ProviderRequest, ProviderResponse};
    use crate::checkpoint::Workspace;
    use crate::context::{FlashSaveConfig, TierPolicy};
    use crate::evidence::{EvidencePolicy, TestResults};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Workspace that records snapshots without touching disk.
    #[derive(Default)]
    struct MemoryWorkspace(Mutex<Vec<String>>);

    impl Workspace for MemoryWorkspace {
        fn snapshot(&self, label: &str) -> anyhow::Result<String> {
            let r = format!("refs/foreman/checkpoints/{label}");
            self.0.lock().unwrap().push(r.clone());
            Ok(r)
        }

        fn contains(&self, git_ref: &str) -> bool {
            self.0.lock().unwrap().iter().any(|r| r == git_ref)
        }

        fn changed_files(&self, _git_ref: &str) -> anyhow::Result<Vec<PathBuf>> {
            Ok(vec![])
        }

        fn restore(&self, _git_ref: &str) -> anyhow::Result<()> {
            Ok(())
        }

        fn discard(&self, label: &str) -> anyhow::Result<()> {
            let r = format!("refs/foreman/checkpoints/{label}");
            self.0.lock().unwrap().retain(|kept| kept != &r);
            Ok(())
        }
    }

    /// Coverage script per task title; unknown titles pass at 95%.
    struct Scripted {
        coverage: HashMap<String, Vec<f64>>,
        calls: Mutex<HashMap<String, usize>>,
        fail_titles: Vec<String>,
    }

    impl Scripted {
        fn new() -> Self {
            Self {
                coverage: HashMap::new(),
                calls: Mutex::new(HashMap::new()),
                fail_titles: Vec::new(),
            }
        }

        fn coverage(mut self, title: &str, values: &[f64]) -> Self {
            self.coverage.insert(title.to_string(), values.to_vec());
            self
        }

        fn failing(mut self, title: &str) -> Self {
            self.fail_titles.push(title.to_string());
            self
        }
    }

    #[async_trait]
    impl AgentProvider for Scripted {
        async fn invoke(&self, request: ProviderRequest) -> anyhow::Result<ProviderResponse> {
            let title = request.task_context.title.clone();
            if request.specialization.is_some() {
                return Ok(ProviderResponse {
                    result: "add tests for the error branches".into(),
                    artifacts: vec![],
                    usage: Usage::default(),
                });
            }
            if self.fail_titles.contains(&title) {
                anyhow::bail!("provider unavailable");
            }
            let n = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(title.clone()).or_insert(0);
                *n += 1;
                *n
            };
            let coverage = self
                .coverage
                .get(&title)
                .map(|v| v[(n - 1).min(v.len() - 1)])
                .unwrap_or(95.0);
            Ok(ProviderResponse {
                result: format!("done {title}"),
                artifacts: vec![Artifact::TestReport(TestResults {
                    total: 3,
                    passed: 3,
                    coverage: Some(coverage),
                    output: "test result: ok. 3 passed".into(),
                    ..Default::default()
                })],
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                    cost_usd: 0.001,
                },
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        db: DbHandle,
        project_id: i64,
        services: LeadServices,
    }

    fn fixture(provider: Scripted) -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = DbHandle::in_memory().unwrap();
        let project_id = {
            let guard = db.lock_sync().unwrap();
            let p = guard.create_project("demo", "/tmp/demo", 1).unwrap();
            guard
                .compare_and_set_status(p.id, ProjectStatus::Init, ProjectStatus::Active, None)
                .unwrap();
            p.id
        };
        let context = Arc::new(ContextManager::new(
            project_id,
            db.clone(),
            TierPolicy::default(),
            FlashSaveConfig::default(),
        ));
        let services = LeadServices {
            provider: Arc::new(provider),
            verifier: Arc::new(EvidenceVerifier::new(EvidencePolicy::default(), db.clone())),
            context,
            checkpoints: Arc::new(CheckpointManager::new(
                project_id,
                db.clone(),
                Arc::new(MemoryWorkspace::default()),
                dir.path().join("checkpoints"),
            )),
            events: EventBus::new(),
            pause: PauseHandle::new(),
        };
        Fixture {
            _dir: dir,
            db,
            project_id,
            services,
        }
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            provider_retry_budget: 0,
            provider_timeout: Duration::from_secs(5),
            provider_backoff: Duration::ZERO,
            ..OrchestratorConfig::default()
        }
    }

    fn feature(title: &str, tasks: &[&str]) -> FeatureSpec {
        FeatureSpec {
            title: title.into(),
            tasks: tasks.iter().map(|t| TaskSpec::new(t, "")).collect(),
            ..Default::default()
        }
    }

    async fn lead(f: &Fixture, config: OrchestratorConfig) -> LeadOrchestrator {
        LeadOrchestrator::load(f.project_id, f.db.clone(), config, f.services.clone())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_plan_persists_and_rejects_replanning() {
        let f = fixture(Scripted::new());
        let mut lead = lead(&f, config()).await;
        lead.plan(vec![feature("Auth", &["schema", "endpoint"])]).await.unwrap();
        assert!(lead.plan(vec![feature("Again", &["x"])]).await.is_err());

        let reloaded = self::lead(&f, config()).await;
        assert_eq!(reloaded.breakdown(), lead.breakdown());
    }

    #[tokio::test]
    async fn test_run_completes_every_issue() {
        let f = fixture(Scripted::new());
        let mut lead = lead(&f, config()).await;
        lead.plan(vec![
            feature("Auth", &["schema", "endpoint"]),
            feature("Billing", &["ledger"]),
        ])
        .await
        .unwrap();

        let summary = lead.run().await.unwrap();
        assert_eq!(summary.tasks_completed, 3);
        assert_eq!(summary.issues_completed, 2);
        assert!(lead.breakdown().all_completed());
        assert_eq!(summary.usage.input_tokens, 30);

        let project_id = f.project_id;
        let (stored, project) = f
            .db
            .call(move |db| Ok((db.load_breakdown(project_id)?, db.get_project(project_id)?)))
            .await
            .unwrap();
        assert!(stored.all_completed());
        assert_eq!(project.unwrap().usage.output_tokens, 15);
        // Workers return to the idle pool.
        assert!(lead.registry().records().all(|a| a.state == AgentState::Idle));
    }

    #[tokio::test]
    async fn test_evidence_block_is_retried_by_same_worker() {
        let f = fixture(Scripted::new().coverage("schema", &[80.0, 90.0]));
        let mut lead = lead(&f, config()).await;
        lead.plan(vec![feature("Auth", &["schema"])]).await.unwrap();

        let summary = lead.run().await.unwrap();
        assert_eq!(summary.tasks_blocked, 1);
        assert_eq!(summary.retries, 1);
        assert_eq!(summary.tasks_completed, 1);

        let task = lead.breakdown().issues()[0].tasks[0].clone();
        assert_eq!(task.status, WorkStatus::Completed);
        assert_eq!(task.attempts, 2);
        assert_eq!(task.assigned_agent.as_deref(), Some("backend-worker-001"));
        let history = f.services.verifier.history(task.id).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_block_escalates_then_opens_blocker() {
        let f = fixture(Scripted::new().coverage("schema", &[50.0]));
        let mut lead = lead(&f, OrchestratorConfig { task_retry_budget: 1, ..config() }).await;
        lead.plan(vec![feature("Auth", &["schema", "endpoint"])]).await.unwrap();

        let summary = lead.run().await.unwrap();
        assert_eq!(summary.retries, 1);
        assert_eq!(summary.escalations, 1);
        assert_eq!(summary.blockers_opened, 1);
        assert_eq!(summary.tasks_completed, 0);
        assert_eq!(lead.awaiting_human(), 1);

        let task = lead.breakdown().issues()[0].tasks[0].clone();
        assert_eq!(task.status, WorkStatus::Blocked);
        assert_eq!(task.violations, vec!["coverage"]);
        assert!(task.reason.as_deref().unwrap().contains("coverage"));
        // The worker keeps the blocked task.
        let worker = lead.registry().get("backend-worker-001").unwrap();
        assert_eq!(worker.state, AgentState::Blocked);
        // The specialist was spawned under the worker and terminated.
        let sub = lead.registry().get("backend-worker-001.sub-001").unwrap();
        assert_eq!(sub.state, AgentState::Terminated);

        // A second run does nothing until the blocker is answered.
        let idle = lead.run().await.unwrap();
        assert_eq!(idle, RunSummary::default());

        let project_id = f.project_id;
        let open = f
            .db
            .call(move |db| db.list_blockers(project_id, true))
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        lead.resolve_blocker(open[0].id, "lower the bar for the migration code")
            .await
            .unwrap();
        assert_eq!(lead.awaiting_human(), 0);
    }

    #[tokio::test]
    async fn test_provider_failure_fails_task_and_issue_after_budget() {
        let f = fixture(Scripted::new().failing("ledger"));
        let mut lead = lead(&f, OrchestratorConfig { task_retry_budget: 1, ..config() }).await;
        lead.plan(vec![
            feature("Billing", &["ledger", "invoices"]),
            feature("Auth", &["schema"]),
        ])
        .await
        .unwrap();

        let summary = lead.run().await.unwrap();
        assert_eq!(summary.retries, 1);
        assert_eq!(summary.tasks_failed, 1);
        assert_eq!(summary.issues_failed, 1);
        // The sibling issue is unaffected.
        assert_eq!(summary.issues_completed, 1);

        let billing = &lead.breakdown().issues()[0];
        assert_eq!(billing.status, WorkStatus::Failed);
        assert_eq!(billing.tasks[0].status, WorkStatus::Failed);
        assert!(billing.tasks[0].reason.as_deref().unwrap().contains("provider unavailable"));
        assert_eq!(billing.tasks[1].status, WorkStatus::Pending);
    }

    #[tokio::test]
    async fn test_ensure_ready_rejects_out_of_sequence() {
        let f = fixture(Scripted::new());
        let mut lead = lead(&f, config()).await;
        lead.plan(vec![feature("Auth", &["schema", "endpoint"])]).await.unwrap();
        let second: WorkNumber = "1.1.2".parse().unwrap();
        match lead.ensure_ready(&second) {
            Err(ForemanError::DependencyNotSatisfied { task, missing }) => {
                assert_eq!(task, "1.1.2");
                assert_eq!(missing, vec!["1.1.1"]);
            }
            other => panic!("Expected DependencyNotSatisfied, got {other:?}"),
        }
        assert!(lead.ensure_ready(&"1.1.1".parse().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_insert_task_persists_renumbering() {
        let f = fixture(Scripted::new());
        let mut lead = lead(&f, config()).await;
        lead.plan(vec![feature("Auth", &["a", "b", "c"])]).await.unwrap();
        let issue: WorkNumber = "1.1".parse().unwrap();
        let number = lead.insert_task(&issue, 2, TaskSpec::new("new", "")).await.unwrap();
        assert_eq!(number.to_string(), "1.1.2");

        let reloaded = self::lead(&f, config()).await;
        let titles: Vec<String> = reloaded.breakdown().issues()[0]
            .tasks
            .iter()
            .map(|t| format!("{}={}", t.number, t.title))
            .collect();
        assert_eq!(titles, vec!["1.1.1=a", "1.1.2=new", "1.1.3=b", "1.1.4=c"]);
    }

    #[tokio::test]
    async fn test_paused_project_dispatches_nothing() {
        let f = fixture(Scripted::new());
        f.services.pause.pause();
        let mut lead = lead(&f, config()).await;
        lead.plan(vec![feature("Auth", &["schema"])]).await.unwrap();
        let summary = lead.run().await.unwrap();
        assert!(summary.paused);
        assert_eq!(summary.tasks_completed, 0);
        assert_eq!(lead.breakdown().issues()[0].status, WorkStatus::Pending);
    }

    #[tokio::test]
    async fn test_run_refuses_stopped_project() {
        let f = fixture(Scripted::new());
        let mut lead = lead(&f, config()).await;
        lead.plan(vec![feature("Auth", &["schema", "endpoint"])]).await.unwrap();
        let project_id = f.project_id;
        f.db.call(move |db| {
            db.set_status(project_id, ProjectStatus::Paused)?;
            db.set_status(project_id, ProjectStatus::Stopped)
        })
        .await
        .unwrap();

        // A freshly loaded lead with a cleared pause signal.
        let mut lead = self::lead(&f, config()).await;
        assert!(!f.services.pause.is_paused());
        let err = lead.run().await.unwrap_err();
        match err {
            ForemanError::NotActive { status, .. } => assert_eq!(status, "stopped"),
            other => panic!("expected NotActive, got {other:?}"),
        }
        let stored = f.db.call(move |db| db.load_breakdown(project_id)).await.unwrap();
        assert!(stored.issues()[0].tasks.iter().all(|t| t.status == WorkStatus::Pending));
        assert_eq!(stored.issues()[0].status, WorkStatus::Pending);
    }

    /// Passes every task and pauses the project in the store while running
    /// `title`, as another process would.
    struct PausesElsewhere {
        inner: Scripted,
        db: DbHandle,
        project_id: i64,
        title: &'static str,
    }

    #[async_trait]
    impl AgentProvider for PausesElsewhere {
        async fn invoke(&self, request: ProviderRequest) -> anyhow::Result<ProviderResponse> {
            if request.task_context.title == self.title {
                let project_id = self.project_id;
                self.db
                    .call(move |db| db.set_status(project_id, ProjectStatus::Paused))
                    .await?;
            }
            self.inner.invoke(request).await
        }
    }

    #[tokio::test]
    async fn test_stored_pause_halts_assignment_mid_run() {
        let mut f = fixture(Scripted::new());
        f.services.provider = Arc::new(PausesElsewhere {
            inner: Scripted::new(),
            db: f.db.clone(),
            project_id: f.project_id,
            title: "schema",
        });
        let mut lead = lead(&f, OrchestratorConfig { max_workers: 1, ..config() }).await;
        lead.plan(vec![
            feature("Auth", &["schema", "endpoint"]),
            feature("Billing", &["ledger"]),
        ])
        .await
        .unwrap();

        let summary = lead.run().await.unwrap();
        // The in-flight task finishes; nothing new is assigned.
        assert_eq!(summary.tasks_completed, 1);
        assert!(summary.paused);
        assert!(f.services.pause.is_paused());
        let endpoint = lead.breakdown().task(&"1.1.2".parse().unwrap()).unwrap();
        assert_eq!(endpoint.status, WorkStatus::Pending);
        assert_eq!(lead.breakdown().issues()[1].status, WorkStatus::Pending);
    }

    #[test]
    fn test_specialization_for_violations() {
        assert_eq!(specialization_for(&["coverage".into()]), "test-coverage");
        assert_eq!(
            specialization_for(&["coverage".into(), "tests_failed".into()]),
            "test-debugging"
        );
        assert_eq!(specialization_for(&["skip_patterns".into()]), "test-hygiene");
        assert_eq!(specialization_for(&["test_output".into()]), "quality");
    }
}
