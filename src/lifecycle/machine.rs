use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::status::{PauseMetadata, Project, ProjectStatus};
use crate::agents::PauseHandle;
use crate::breakdown::WorkBreakdown;
use crate::checkpoint::{Checkpoint, CheckpointManager, CheckpointTrigger, RestoreOutcome};
use crate::context::{ContextManager, FlashSaveResult};
use crate::errors::ForemanError;
use crate::events::{EventBus, EventType};
use crate::store::DbHandle;

/// Returned by [`ProjectLifecycle::pause`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseResult {
    pub checkpoint_id: i64,
    pub previous_status: ProjectStatus,
    pub paused_at: DateTime<Utc>,
    /// One entry per agent that crossed the flash-save threshold.
    pub flash_saves: Vec<FlashSaveResult>,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub reduction_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeResult {
    /// Pause checkpoint whose context was reloaded, if any.
    pub restored_from: Option<i64>,
    pub context_items: usize,
}

/// Drives one project's status through its lifecycle.
///
/// Transitions are serialized by an internal lock and written with
/// compare-and-set, so two callers can never both pause the same project.
pub struct ProjectLifecycle {
    project_id: i64,
    db: DbHandle,
    context: Arc<ContextManager>,
    checkpoints: Arc<CheckpointManager>,
    events: EventBus,
    pause: PauseHandle,
    guard: tokio::sync::Mutex<()>,
}

impl ProjectLifecycle {
    pub fn new(
        project_id: i64,
        db: DbHandle,
        context: Arc<ContextManager>,
        checkpoints: Arc<CheckpointManager>,
        events: EventBus,
        pause: PauseHandle,
    ) -> Self {
        Self {
            project_id,
            db,
            context,
            checkpoints,
            events,
            pause,
            guard: tokio::sync::Mutex::new(()),
        }
    }

    pub fn pause_handle(&self) -> &PauseHandle {
        &self.pause
    }

    pub async fn project(&self) -> Result<Project, ForemanError> {
        let project_id = self.project_id;
        self.db
            .persist(move |db| db.get_project(project_id))
            .await?
            .ok_or_else(|| ForemanError::not_found("project", project_id))
    }

    pub async fn status(&self) -> Result<ProjectStatus, ForemanError> {
        Ok(self.project().await?.status)
    }

    /// Compare-and-set `from -> to`. A lost race reports the status actually found.
    async fn transition(
        &self,
        from: ProjectStatus,
        to: ProjectStatus,
        pause: Option<PauseMetadata>,
    ) -> Result<(), ForemanError> {
        if !from.can_transition_to(to) {
            return Err(invalid(from, to));
        }
        let project_id = self.project_id;
        let swapped = self
            .db
            .persist(move |db| db.compare_and_set_status(project_id, from, to, pause.as_ref()))
            .await?;
        if !swapped {
            let actual = self.status().await?;
            return Err(invalid(actual, to));
        }
        tracing::info!(project_id, from = %from, to = %to, "Project status changed");
        Ok(())
    }

    pub async fn start_planning(&self) -> Result<(), ForemanError> {
        let _guard = self.guard.lock().await;
        self.transition(ProjectStatus::Init, ProjectStatus::Planning, None)
            .await
    }

    pub async fn activate(&self) -> Result<(), ForemanError> {
        let _guard = self.guard.lock().await;
        self.transition(ProjectStatus::Planning, ProjectStatus::Active, None)
            .await?;
        self.pause.clear();
        Ok(())
    }

    /// `init -> planning -> active`, storing `breakdown` in between.
    ///
    /// If storing the breakdown or activating fails, the status goes back to
    /// `init` with no breakdown left behind, so planning can be retried.
    pub async fn plan(&self, breakdown: &WorkBreakdown) -> Result<(), ForemanError> {
        let _guard = self.guard.lock().await;
        let project_id = self.project_id;
        let existing = self
            .db
            .persist(move |db| db.load_breakdown(project_id))
            .await?;
        if !existing.is_empty() {
            return Err(ForemanError::validation(format!(
                "project {project_id} already has a work breakdown"
            )));
        }

        self.transition(ProjectStatus::Init, ProjectStatus::Planning, None)
            .await?;
        let row = breakdown.clone();
        let stored = match self
            .db
            .persist(move |db| db.save_breakdown(project_id, &row))
            .await
        {
            Ok(()) => {
                self.transition(ProjectStatus::Planning, ProjectStatus::Active, None)
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = stored {
            tracing::error!(project_id, error = %e, "Planning failed, rolling back");
            let empty = WorkBreakdown::new(breakdown.scope());
            if let Err(rollback) = self
                .db
                .persist(move |db| {
                    db.save_breakdown(project_id, &empty)?;
                    db.set_status(project_id, ProjectStatus::Init)
                })
                .await
            {
                tracing::error!(project_id, error = %rollback, "Planning rollback failed");
            }
            return Err(e);
        }
        self.pause.clear();
        Ok(())
    }

    /// Pause an active project.
    ///
    /// Workers are signalled first so they stop at their next suspension
    /// point. Then every agent over the flash-save threshold is compacted, a
    /// `pause` checkpoint is taken, and the status is written with its pause
    /// metadata. If any of those steps fails the status is put back to what
    /// it was, the signal is withdrawn and the error is returned.
    pub async fn pause(&self, reason: &str) -> Result<PauseResult, ForemanError> {
        let _guard = self.guard.lock().await;
        let previous = self.status().await?;
        if previous != ProjectStatus::Active {
            return Err(invalid(previous, ProjectStatus::Paused));
        }

        self.pause.pause();
        match self.pause_steps(reason, previous).await {
            Ok(result) => {
                self.events.emit(
                    EventType::ProjectPaused,
                    self.project_id,
                    json!({
                        "reason": reason,
                        "checkpoint_id": result.checkpoint_id,
                        "tokens_before": result.tokens_before,
                        "tokens_after": result.tokens_after,
                        "reduction_percentage": result.reduction_percentage,
                    }),
                );
                Ok(result)
            }
            Err(e) => {
                tracing::error!(project_id = self.project_id, error = %e, "Pause failed, rolling back");
                let project_id = self.project_id;
                if let Err(rollback) = self
                    .db
                    .persist(move |db| db.set_status(project_id, previous))
                    .await
                {
                    tracing::error!(project_id, error = %rollback, "Status rollback failed");
                }
                self.pause.clear();
                Err(e)
            }
        }
    }

    async fn pause_steps(
        &self,
        reason: &str,
        previous: ProjectStatus,
    ) -> Result<PauseResult, ForemanError> {
        let mut flash_saves = Vec::new();
        for agent in self.context.agents() {
            if self.context.should_flash_save(&agent) {
                let saved = self.context.flash_save(&agent).await?;
                self.events.emit(
                    EventType::FlashSaveCompleted,
                    self.project_id,
                    json!({
                        "agent_id": saved.agent_id,
                        "tokens_before": saved.tokens_before,
                        "tokens_after": saved.tokens_after,
                        "reduction_percentage": saved.reduction_percentage,
                        "items_archived": saved.items_archived,
                    }),
                );
                flash_saves.push(saved);
            }
        }

        let checkpoint = self
            .checkpoint(CheckpointTrigger::Pause, Some(reason.to_string()))
            .await?;

        let paused_at = Utc::now();
        let metadata = PauseMetadata {
            reason: reason.to_string(),
            checkpoint_id: checkpoint.id,
            paused_at,
            previous_status: previous,
        };
        self.transition(previous, ProjectStatus::Paused, Some(metadata))
            .await?;

        let tokens_before: usize = flash_saves.iter().map(|s| s.tokens_before).sum();
        let tokens_after: usize = flash_saves.iter().map(|s| s.tokens_after).sum();
        let reduction_percentage = if tokens_before == 0 {
            0.0
        } else {
            tokens_before.saturating_sub(tokens_after) as f64 / tokens_before as f64 * 100.0
        };
        Ok(PauseResult {
            checkpoint_id: checkpoint.id,
            previous_status: previous,
            paused_at,
            flash_saves,
            tokens_before,
            tokens_after,
            reduction_percentage,
        })
    }

    /// Return a paused project to `active`.
    ///
    /// No flash save happens here. With `restore_if_lost`, an empty context
    /// (a fresh process) is reloaded from the pause checkpoint first.
    pub async fn resume(&self, restore_if_lost: bool) -> Result<ResumeResult, ForemanError> {
        let _guard = self.guard.lock().await;
        let project = self.project().await?;
        if project.status != ProjectStatus::Paused {
            return Err(invalid(project.status, ProjectStatus::Active));
        }

        let mut restored_from = None;
        if restore_if_lost
            && self.context.is_empty()
            && let Some(meta) = &project.pause_metadata
        {
            let snapshot = self
                .checkpoints
                .load_context_snapshot(meta.checkpoint_id)
                .await?;
            self.context.restore_snapshot(&snapshot)?;
            restored_from = Some(meta.checkpoint_id);
            tracing::info!(
                project_id = self.project_id,
                checkpoint_id = meta.checkpoint_id,
                items = snapshot.item_count(),
                "Context reloaded from pause checkpoint"
            );
        }

        self.transition(ProjectStatus::Paused, ProjectStatus::Active, None)
            .await?;
        self.pause.clear();
        self.events.emit(
            EventType::ProjectResumed,
            self.project_id,
            json!({ "restored_from": restored_from }),
        );
        Ok(ResumeResult {
            restored_from,
            context_items: self.context.item_count(),
        })
    }

    /// `paused -> stopped`. No task is assigned afterwards.
    pub async fn stop(&self) -> Result<(), ForemanError> {
        let _guard = self.guard.lock().await;
        self.transition(ProjectStatus::Paused, ProjectStatus::Stopped, None)
            .await?;
        self.pause.pause();
        self.events
            .emit(EventType::ProjectStopped, self.project_id, json!({}));
        Ok(())
    }

    /// Mark the project completed once every issue is.
    pub async fn complete(&self) -> Result<(), ForemanError> {
        let _guard = self.guard.lock().await;
        let project_id = self.project_id;
        let (project, breakdown) = self
            .db
            .persist(move |db| {
                let project = db.get_project(project_id)?;
                Ok((project, db.load_breakdown(project_id)?))
            })
            .await?;
        let project = project.ok_or_else(|| ForemanError::not_found("project", project_id))?;
        if !breakdown.all_completed() {
            let (done, total) = breakdown.task_counts();
            return Err(ForemanError::validation(format!(
                "project {project_id} has unfinished work ({done}/{total} tasks completed)"
            )));
        }
        self.transition(project.status, ProjectStatus::Completed, None)
            .await?;
        self.events.emit(
            EventType::ProjectCompleted,
            project_id,
            json!({ "tasks": breakdown.task_counts().1 }),
        );
        Ok(())
    }

    /// Take a checkpoint of the current project state.
    pub async fn checkpoint(
        &self,
        trigger: CheckpointTrigger,
        note: Option<String>,
    ) -> Result<Checkpoint, ForemanError> {
        let snapshot = self.context.snapshot();
        let checkpoint = self
            .checkpoints
            .create(trigger, &snapshot, self.context.agents(), note)
            .await?;
        self.events.emit(
            EventType::CheckpointCreated,
            self.project_id,
            json!({ "checkpoint_id": checkpoint.id, "trigger": trigger.as_str() }),
        );
        Ok(checkpoint)
    }

    /// Restore a checkpoint into a paused project. The lifecycle status is
    /// not part of the checkpoint and stays `paused`.
    pub async fn restore(&self, checkpoint_id: i64) -> Result<RestoreOutcome, ForemanError> {
        let _guard = self.guard.lock().await;
        let status = self.status().await?;
        if status != ProjectStatus::Paused {
            return Err(ForemanError::validation(format!(
                "project must be paused to restore a checkpoint (status is {status})"
            )));
        }
        let outcome = self.checkpoints.restore(checkpoint_id, &self.context).await?;
        self.events.emit(
            EventType::CheckpointRestored,
            self.project_id,
            json!({
                "checkpoint_id": outcome.checkpoint_id,
                "files_restored": outcome.files_restored,
                "issues_restored": outcome.issues_restored,
            }),
        );
        Ok(outcome)
    }
}

fn invalid(from: ProjectStatus, to: ProjectStatus) -> ForemanError {
    ForemanError::InvalidTransition {
        entity: "project",
        from: from.to_string(),
        to: to.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakdown::{FeatureSpec, TaskSpec, WorkStatus};
    use crate::checkpoint::GitWorkspace;
    use crate::context::{FlashSaveConfig, ItemKind, TierPolicy};
    use crate::events::{Notifier, ProjectEvent};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recording(Mutex<Vec<EventType>>);

    impl Notifier for Recording {
        fn notify(&self, event: &ProjectEvent) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(event.event_type);
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        db: DbHandle,
        project_id: i64,
        context: Arc<ContextManager>,
        events: Arc<Recording>,
        lifecycle: ProjectLifecycle,
    }

    fn fixture(flash: FlashSaveConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("README.md"), "demo").unwrap();
        let db = DbHandle::in_memory().unwrap();
        let project_id = {
            let guard = db.lock_sync().unwrap();
            let p = guard
                .create_project("demo", &dir.path().display().to_string(), 1)
                .unwrap();
            let wb = WorkBreakdown::from_features(
                1,
                vec![FeatureSpec {
                    title: "Auth".into(),
                    tasks: vec![TaskSpec::new("schema", "")],
                    ..Default::default()
                }],
            )
            .unwrap();
            guard.save_breakdown(p.id, &wb).unwrap();
            p.id
        };
        let context = Arc::new(ContextManager::new(
            project_id,
            db.clone(),
            TierPolicy::default(),
            flash,
        ));
        let workspace = Arc::new(GitWorkspace::init_or_open(dir.path()).unwrap());
        let checkpoints = Arc::new(CheckpointManager::new(
            project_id,
            db.clone(),
            workspace,
            dir.path().join(".foreman/checkpoints"),
        ));
        let events = Arc::new(Recording::default());
        let lifecycle = ProjectLifecycle::new(
            project_id,
            db.clone(),
            context.clone(),
            checkpoints,
            EventBus::new().with_notifier(events.clone()),
            PauseHandle::new(),
        );
        Fixture {
            _dir: dir,
            db,
            project_id,
            context,
            events,
            lifecycle,
        }
    }

    async fn active(f: &Fixture) {
        f.lifecycle.start_planning().await.unwrap();
        f.lifecycle.activate().await.unwrap();
    }

    #[tokio::test]
    async fn test_planning_entered_once() {
        let f = fixture(FlashSaveConfig::default());
        f.lifecycle.start_planning().await.unwrap();
        assert!(matches!(
            f.lifecycle.start_planning().await,
            Err(ForemanError::InvalidTransition { .. })
        ));
        f.lifecycle.activate().await.unwrap();
        assert_eq!(f.lifecycle.status().await.unwrap(), ProjectStatus::Active);
    }

    #[tokio::test]
    async fn test_pause_requires_active() {
        let f = fixture(FlashSaveConfig::default());
        let err = f.lifecycle.pause("lunch").await.unwrap_err();
        match err {
            ForemanError::InvalidTransition { entity, from, to } => {
                assert_eq!(entity, "project");
                assert_eq!(from, "init");
                assert_eq!(to, "paused");
            }
            other => panic!("Expected InvalidTransition, got {other:?}"),
        }
        assert!(!f.lifecycle.pause_handle().is_paused());
    }

    #[tokio::test]
    async fn test_pause_records_metadata_and_flash_saves() {
        let f = fixture(FlashSaveConfig {
            threshold_tokens: 10,
            max_tokens: 100,
        });
        active(&f).await;
        f.context
            .add_item("backend-worker-001", ItemKind::FileExcerpt, "x".repeat(400));
        for _ in 0..3 {
            f.context.end_turn("backend-worker-001");
        }

        let result = f.lifecycle.pause("end of day").await.unwrap();
        assert_eq!(result.previous_status, ProjectStatus::Active);
        assert_eq!(result.flash_saves.len(), 1);
        assert_eq!(result.flash_saves[0].items_archived, 1);
        assert!(result.reduction_percentage > 0.0);
        assert!(f.lifecycle.pause_handle().is_paused());

        let project = f.lifecycle.project().await.unwrap();
        assert_eq!(project.status, ProjectStatus::Paused);
        let meta = project.pause_metadata.unwrap();
        assert_eq!(meta.reason, "end of day");
        assert_eq!(meta.checkpoint_id, result.checkpoint_id);

        let events = f.events.0.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                EventType::FlashSaveCompleted,
                EventType::CheckpointCreated,
                EventType::ProjectPaused
            ]
        );
    }

    #[tokio::test]
    async fn test_pause_rolls_back_on_persistence_failure() {
        let f = fixture(FlashSaveConfig::default());
        active(&f).await;
        f.db.lock_sync()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER fail_pause BEFORE UPDATE OF status ON projects
                 WHEN NEW.status = 'paused'
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();

        let err = f.lifecycle.pause("maintenance").await.unwrap_err();
        assert!(matches!(err, ForemanError::Persistence(_)));
        assert!(err.to_string().contains("disk full"));
        assert_eq!(f.lifecycle.status().await.unwrap(), ProjectStatus::Active);
        assert!(!f.lifecycle.pause_handle().is_paused());
        assert!(!f.events.0.lock().unwrap().contains(&EventType::ProjectPaused));
    }

    #[tokio::test]
    async fn test_resume_reloads_lost_context_from_pause_checkpoint() {
        let f = fixture(FlashSaveConfig::default());
        active(&f).await;
        f.context.add_item("backend-worker-001", ItemKind::Note, "remember the schema");
        let before = f.context.snapshot();
        f.lifecycle.pause("restart").await.unwrap();

        // A fresh process starts with an empty context.
        f.context.restore_snapshot(&crate::context::ContextSnapshot {
            project_id: f.project_id,
            agents: Default::default(),
        })
        .unwrap();
        assert!(f.context.is_empty());

        let resumed = f.lifecycle.resume(true).await.unwrap();
        assert!(resumed.restored_from.is_some());
        assert_eq!(f.context.snapshot(), before);
        assert_eq!(f.lifecycle.status().await.unwrap(), ProjectStatus::Active);
        assert!(!f.lifecycle.pause_handle().is_paused());
    }

    #[tokio::test]
    async fn test_stop_only_from_paused() {
        let f = fixture(FlashSaveConfig::default());
        active(&f).await;
        assert!(f.lifecycle.stop().await.is_err());
        f.lifecycle.pause("done for now").await.unwrap();
        f.lifecycle.stop().await.unwrap();
        assert_eq!(f.lifecycle.status().await.unwrap(), ProjectStatus::Stopped);
        assert!(f.lifecycle.resume(false).await.is_err());
        assert!(f.lifecycle.pause_handle().is_paused());
    }

    #[tokio::test]
    async fn test_complete_requires_finished_issues() {
        let f = fixture(FlashSaveConfig::default());
        active(&f).await;
        assert!(matches!(
            f.lifecycle.complete().await,
            Err(ForemanError::Validation(_))
        ));

        let project_id = f.project_id;
        f.db.call(move |db| {
            let mut wb = db.load_breakdown(project_id)?;
            let issue = wb.issues()[0].clone();
            let mut task = issue.tasks[0].clone();
            task.status = WorkStatus::Completed;
            db.save_task(&task)?;
            let mut issue = issue;
            issue.status = WorkStatus::Completed;
            db.save_issue_status(&issue)?;
            wb = db.load_breakdown(project_id)?;
            anyhow::ensure!(wb.all_completed());
            Ok(())
        })
        .await
        .unwrap();

        f.lifecycle.complete().await.unwrap();
        assert_eq!(f.lifecycle.status().await.unwrap(), ProjectStatus::Completed);
    }

    #[tokio::test]
    async fn test_restore_requires_paused() {
        let f = fixture(FlashSaveConfig::default());
        active(&f).await;
        let cp = f
            .lifecycle
            .checkpoint(CheckpointTrigger::Manual, None)
            .await
            .unwrap();
        assert!(matches!(
            f.lifecycle.restore(cp.id).await,
            Err(ForemanError::Validation(_))
        ));
        f.lifecycle.pause("restore").await.unwrap();
        let outcome = f.lifecycle.restore(cp.id).await.unwrap();
        assert_eq!(outcome.checkpoint_id, cp.id);
        assert_eq!(f.lifecycle.status().await.unwrap(), ProjectStatus::Paused);
    }
}
