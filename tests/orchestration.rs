//! End-to-end orchestration tests: a scripted provider driving the lead,
//! lifecycle, checkpoints and evidence gate against a real git workspace and
//! an on-disk state database.

use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use foreman::agents::{
    AgentProvider, Artifact, PauseHandle, ProviderRequest, ProviderResponse, Usage,
};
use foreman::breakdown::{FeatureSpec, TaskSpec, WorkBreakdown, WorkNumber, WorkStatus};
use foreman::checkpoint::{CheckpointManager, CheckpointTrigger, GitWorkspace, Workspace};
use foreman::context::{ContextManager, FlashSaveConfig, ItemKind, TierPolicy};
use foreman::errors::ForemanError;
use foreman::events::{EventBus, EventType, Notifier, ProjectEvent};
use foreman::evidence::{EvidencePolicy, EvidenceVerifier, TestResults, VerificationRequest};
use foreman::lifecycle::{ProjectLifecycle, ProjectStatus};
use foreman::orchestrator::{LeadOrchestrator, LeadServices, OrchestratorConfig};
use foreman::store::DbHandle;

/// Passing provider with an optional per-title delay.
#[derive(Default)]
struct Scripted {
    delays: HashMap<String, Duration>,
}

impl Scripted {
    fn delay(mut self, title: &str, delay: Duration) -> Self {
        self.delays.insert(title.to_string(), delay);
        self
    }
}

#[async_trait]
impl AgentProvider for Scripted {
    async fn invoke(&self, request: ProviderRequest) -> anyhow::Result<ProviderResponse> {
        let title = request.task_context.title.clone();
        if let Some(delay) = self.delays.get(&title) {
            tokio::time::sleep(*delay).await;
        }
        Ok(ProviderResponse {
            result: format!("implemented {title}"),
            artifacts: vec![Artifact::TestReport(TestResults {
                total: 4,
                passed: 4,
                coverage: Some(92.0),
                output: "test result: ok. 4 passed; 0 failed".into(),
                ..Default::default()
            })],
            usage: Usage {
                input_tokens: 100,
                output_tokens: 40,
                cost_usd: 0.01,
            },
        })
    }
}

#[derive(Default)]
struct Recording(Mutex<Vec<ProjectEvent>>);

impl Recording {
    fn of_type(&self, event_type: EventType) -> Vec<ProjectEvent> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

impl Notifier for Recording {
    fn notify(&self, event: &ProjectEvent) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(event.clone());
        Ok(())
    }
}

struct Harness {
    dir: TempDir,
    db: DbHandle,
    project_id: i64,
    context: Arc<ContextManager>,
    workspace: Arc<GitWorkspace>,
    checkpoints: Arc<CheckpointManager>,
    events: Arc<Recording>,
    lifecycle: ProjectLifecycle,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("README.md"), "# demo\n").unwrap();
        let workspace = Arc::new(GitWorkspace::init_or_open(dir.path()).unwrap());
        let foreman_dir = dir.path().join(".foreman");

        let db = DbHandle::open(&foreman_dir.join("state.db")).unwrap();
        let project_id = db
            .lock_sync()
            .unwrap()
            .create_project("demo", &dir.path().display().to_string(), 1)
            .unwrap()
            .id;

        let context = Arc::new(ContextManager::new(
            project_id,
            db.clone(),
            TierPolicy::default(),
            FlashSaveConfig::default(),
        ));
        let checkpoints = Arc::new(CheckpointManager::new(
            project_id,
            db.clone(),
            workspace.clone(),
            foreman_dir.join("checkpoints"),
        ));
        let events = Arc::new(Recording::default());
        let lifecycle = ProjectLifecycle::new(
            project_id,
            db.clone(),
            context.clone(),
            checkpoints.clone(),
            EventBus::new().with_notifier(events.clone()),
            PauseHandle::new(),
        );

        Self {
            dir,
            db,
            project_id,
            context,
            workspace,
            checkpoints,
            events,
            lifecycle,
        }
    }

    fn services(&self, provider: Scripted) -> LeadServices {
        LeadServices {
            provider: Arc::new(provider),
            verifier: Arc::new(EvidenceVerifier::new(EvidencePolicy::default(), self.db.clone())),
            context: self.context.clone(),
            checkpoints: self.checkpoints.clone(),
            events: EventBus::new().with_notifier(self.events.clone()),
            pause: self.lifecycle.pause_handle().clone(),
        }
    }

    async fn lead(&self, provider: Scripted) -> LeadOrchestrator {
        LeadOrchestrator::load(self.project_id, self.db.clone(), config(), self.services(provider))
            .await
            .unwrap()
    }

    /// Plan `features` and move the project to active.
    async fn planned(&self, provider: Scripted, features: Vec<FeatureSpec>) -> LeadOrchestrator {
        self.lifecycle.start_planning().await.unwrap();
        let mut lead = self.lead(provider).await;
        lead.plan(features).await.unwrap();
        self.lifecycle.activate().await.unwrap();
        lead
    }

    async fn stored_breakdown(&self) -> WorkBreakdown {
        let project_id = self.project_id;
        self.db
            .call(move |db| db.load_breakdown(project_id))
            .await
            .unwrap()
    }
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        provider_retry_budget: 0,
        provider_timeout: Duration::from_secs(10),
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

fn number(s: &str) -> WorkNumber {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_task_completion_timestamps_follow_task_order() {
    let h = Harness::new();
    let mut lead = h
        .planned(Scripted::default(), vec![feature("Auth", &["schema", "handler", "tests"])])
        .await;

    let summary = lead.run().await.unwrap();
    assert_eq!(summary.tasks_completed, 3);

    let stored = h.stored_breakdown().await;
    let tasks = &stored.issues()[0].tasks;
    let stamps: Vec<_> = tasks.iter().map(|t| t.completed_at.unwrap()).collect();
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    // Each task starts only after its predecessor completed.
    for pair in tasks.windows(2) {
        assert!(pair[1].started_at.unwrap() >= pair[0].completed_at.unwrap());
        assert_eq!(pair[1].depends_on, vec![pair[0].number.clone()]);
    }
}

#[tokio::test]
async fn test_sibling_issues_complete_out_of_index_order() {
    let h = Harness::new();
    let provider = Scripted::default().delay("slow-step", Duration::from_millis(300));
    let mut lead = h
        .planned(provider, vec![feature("Slow", &["slow-step"]), feature("Fast", &["fast-step"])])
        .await;

    let summary = lead.run().await.unwrap();
    assert_eq!(summary.issues_completed, 2);

    let completed: Vec<String> = h
        .events
        .of_type(EventType::IssueCompleted)
        .iter()
        .map(|e| e.payload["issue"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(completed, vec!["1.2".to_string(), "1.1".to_string()]);

    let stored = h.stored_breakdown().await;
    let slow = stored.task(&number("1.1.1")).unwrap();
    let fast = stored.task(&number("1.2.1")).unwrap();
    assert!(fast.completed_at.unwrap() < slow.completed_at.unwrap());
    assert_ne!(slow.assigned_agent, fast.assigned_agent);
}

#[tokio::test]
async fn test_flash_save_is_idempotent() {
    let h = Harness::new();
    let agent = "backend-worker-001";
    for i in 0..4 {
        h.context
            .add_item(agent, ItemKind::FileExcerpt, format!("excerpt {i}: {}", "x".repeat(400)));
    }
    for _ in 0..3 {
        h.context.end_turn(agent);
    }
    h.context.add_item(agent, ItemKind::Message, "current instruction");

    let first = h.context.flash_save(agent).await.unwrap();
    assert_eq!(first.items_archived, 4);
    assert!(first.reduction_percentage > 0.0);

    let second = h.context.flash_save(agent).await.unwrap();
    assert_eq!(second.items_archived, 0);
    assert_eq!(second.reduction_percentage, 0.0);
    assert_eq!(second.tokens_before, second.tokens_after);
}

#[tokio::test]
async fn test_checkpoint_round_trip_restores_state_workspace_and_context() {
    let h = Harness::new();
    let mut lead = h
        .planned(Scripted::default(), vec![feature("Auth", &["schema", "handler"])])
        .await;
    h.context.add_item("backend-worker-001", ItemKind::Note, "use argon2 for hashes");
    fs::write(h.dir.path().join("schema.sql"), "CREATE TABLE users (id INTEGER);").unwrap();

    let state_before = h.stored_breakdown().await;
    let context_before = h.context.snapshot();
    let checkpoint = h
        .lifecycle
        .checkpoint(CheckpointTrigger::Manual, Some("before run".into()))
        .await
        .unwrap();

    lead.run().await.unwrap();
    fs::write(h.dir.path().join("schema.sql"), "DROP TABLE users;").unwrap();
    fs::write(h.dir.path().join("handler.rs"), "fn login() {}").unwrap();
    h.context.add_item("backend-worker-001", ItemKind::Note, "later thought");
    assert!(h.stored_breakdown().await.all_completed());

    h.lifecycle.pause("restore drill").await.unwrap();
    let outcome = h.lifecycle.restore(checkpoint.id).await.unwrap();
    assert_eq!(outcome.files_restored, 2);

    assert_eq!(h.stored_breakdown().await, state_before);
    assert_eq!(
        fs::read_to_string(h.dir.path().join("schema.sql")).unwrap(),
        "CREATE TABLE users (id INTEGER);"
    );
    assert!(!h.dir.path().join("handler.rs").exists());
    assert!(h.workspace.changed_files(&checkpoint.git_ref).unwrap().is_empty());
    assert_eq!(h.context.snapshot(), context_before);
    assert_eq!(h.lifecycle.status().await.unwrap(), ProjectStatus::Paused);
    // The state database survives a workspace restore.
    assert!(h.dir.path().join(".foreman").join("state.db").exists());
}

#[tokio::test]
async fn test_pause_resume_keeps_task_graph() {
    let h = Harness::new();
    let mut lead = h
        .planned(
            Scripted::default(),
            vec![feature("Auth", &["schema", "handler"]), feature("Billing", &["ledger"])],
        )
        .await;
    let before = h.stored_breakdown().await;

    let paused = h.lifecycle.pause("end of day").await.unwrap();
    assert_eq!(paused.previous_status, ProjectStatus::Active);
    // A paused project dispatches nothing.
    let err = lead.run().await.unwrap_err();
    assert!(matches!(err, ForemanError::NotActive { .. }), "{err}");
    assert_eq!(h.stored_breakdown().await, before);

    h.lifecycle.resume(true).await.unwrap();
    assert_eq!(h.lifecycle.status().await.unwrap(), ProjectStatus::Active);
    assert_eq!(h.stored_breakdown().await, before);

    let summary = lead.run().await.unwrap();
    assert_eq!(summary.tasks_completed, 3);
    h.lifecycle.complete().await.unwrap();
    assert_eq!(h.lifecycle.status().await.unwrap(), ProjectStatus::Completed);
}

/// A lead built the way a new process builds one: fresh pause signal,
/// state loaded from disk.
async fn fresh_lead(h: &Harness) -> LeadOrchestrator {
    let services = LeadServices {
        pause: PauseHandle::new(),
        ..h.services(Scripted::default())
    };
    LeadOrchestrator::load(h.project_id, h.db.clone(), config(), services)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_stopped_project_assigns_no_tasks() {
    let h = Harness::new();
    h.planned(Scripted::default(), vec![feature("Auth", &["schema", "handler"])]).await;
    let before = h.stored_breakdown().await;

    h.lifecycle.pause("wrapping up").await.unwrap();
    h.lifecycle.stop().await.unwrap();
    assert_eq!(h.lifecycle.status().await.unwrap(), ProjectStatus::Stopped);

    let mut lead = fresh_lead(&h).await;
    let err = lead.run().await.unwrap_err();
    match err {
        ForemanError::NotActive { status, .. } => assert_eq!(status, "stopped"),
        other => panic!("expected NotActive, got {other:?}"),
    }
    assert_eq!(h.stored_breakdown().await, before);
    assert!(h.events.of_type(EventType::TaskStarted).is_empty());
}

#[tokio::test]
async fn test_paused_project_assigns_no_tasks_from_fresh_lead() {
    let h = Harness::new();
    h.planned(Scripted::default(), vec![feature("Auth", &["schema"])]).await;
    h.lifecycle.pause("overnight").await.unwrap();
    let before = h.stored_breakdown().await;

    let mut lead = fresh_lead(&h).await;
    let err = lead.run().await.unwrap_err();
    match err {
        ForemanError::NotActive { status, .. } => assert_eq!(status, "paused"),
        other => panic!("expected NotActive, got {other:?}"),
    }
    assert_eq!(h.stored_breakdown().await, before);
    assert!(h.events.of_type(EventType::TaskStarted).is_empty());

    // Once resumed, the same lead runs the graph to completion.
    h.lifecycle.resume(true).await.unwrap();
    let summary = lead.run().await.unwrap();
    assert_eq!(summary.tasks_completed, 1);
}

#[tokio::test]
async fn test_evidence_gate_thresholds() {
    let h = Harness::new();
    h.planned(Scripted::default(), vec![feature("Auth", &["schema"])]).await;
    let task = h.stored_breakdown().await.issues()[0].tasks[0].clone();
    let verifier = EvidenceVerifier::new(EvidencePolicy::default(), h.db.clone());

    let request = |coverage: f64, attempt: u32| VerificationRequest {
        project_id: h.project_id,
        task_id: task.id,
        task_number: task.number.clone(),
        agent_id: Some("backend-worker-001".into()),
        attempt,
        results: TestResults {
            total: 10,
            passed: 10,
            coverage: Some(coverage),
            output: "test result: ok. 10 passed".into(),
            ..Default::default()
        },
        skip_violations: vec![],
    };

    let rejected = verifier.verify(request(80.0, 1)).await.unwrap();
    assert!(!rejected.passed);
    assert!(rejected.thresholds().contains(&"coverage".to_string()));

    let accepted = verifier.verify(request(90.0, 2)).await.unwrap();
    assert!(accepted.passed);
    assert!(accepted.violations.is_empty());

    let history = verifier.history(task.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].id, accepted.record_id);
}

#[tokio::test]
async fn test_pause_persistence_failure_leaves_project_active() {
    let h = Harness::new();
    h.planned(Scripted::default(), vec![feature("Auth", &["schema"])]).await;
    let before = h.stored_breakdown().await;

    // A second connection installs a trigger that fails the status write.
    let conn = rusqlite::Connection::open(h.dir.path().join(".foreman").join("state.db")).unwrap();
    conn.execute_batch(
        "CREATE TRIGGER fail_pause BEFORE UPDATE OF status ON projects
         WHEN NEW.status = 'paused'
         BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
    )
    .unwrap();
    drop(conn);

    let err = h.lifecycle.pause("maintenance").await.unwrap_err();
    assert!(matches!(err, ForemanError::Persistence(_)));
    assert_eq!(h.lifecycle.status().await.unwrap(), ProjectStatus::Active);
    assert!(!h.lifecycle.pause_handle().is_paused());
    assert_eq!(h.stored_breakdown().await, before);
    assert!(h.events.of_type(EventType::ProjectPaused).is_empty());
}

#[tokio::test]
async fn test_plan_persistence_failure_returns_project_to_init() {
    let h = Harness::new();
    let breakdown =
        WorkBreakdown::from_features(1, vec![feature("Auth", &["schema", "handler"])]).unwrap();

    let conn = rusqlite::Connection::open(h.dir.path().join(".foreman").join("state.db")).unwrap();
    conn.execute_batch(
        "CREATE TRIGGER fail_plan BEFORE INSERT ON issues
         BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
    )
    .unwrap();

    let err = h.lifecycle.plan(&breakdown).await.unwrap_err();
    assert!(matches!(err, ForemanError::Persistence(_)), "{err}");
    assert_eq!(h.lifecycle.status().await.unwrap(), ProjectStatus::Init);
    assert!(h.stored_breakdown().await.is_empty());

    // Planning can be retried once the store recovers.
    conn.execute_batch("DROP TRIGGER fail_plan;").unwrap();
    drop(conn);
    h.lifecycle.plan(&breakdown).await.unwrap();
    assert_eq!(h.lifecycle.status().await.unwrap(), ProjectStatus::Active);
    assert_eq!(h.stored_breakdown().await.task_counts(), (0, 2));

    let err = h.lifecycle.plan(&breakdown).await.unwrap_err();
    assert!(matches!(err, ForemanError::Validation(_)), "{err}");
}

#[tokio::test]
async fn test_insert_task_renumbers_and_rewrites_dependencies() {
    let h = Harness::new();
    let mut lead = h
        .planned(Scripted::default(), vec![feature("Auth", &["schema", "handler", "tests"])])
        .await;

    let issue = number("1.1");
    let inserted = lead
        .insert_task(&issue, 2, TaskSpec::new("migration", "add users table"))
        .await
        .unwrap();
    assert_eq!(inserted, number("1.1.2"));

    let stored = h.stored_breakdown().await;
    let tasks = &stored.issues()[0].tasks;
    let titles: Vec<_> = tasks.iter().map(|t| (t.number.to_string(), t.title.as_str())).collect();
    assert_eq!(
        titles,
        vec![
            ("1.1.1".to_string(), "schema"),
            ("1.1.2".to_string(), "migration"),
            ("1.1.3".to_string(), "handler"),
            ("1.1.4".to_string(), "tests"),
        ]
    );
    assert!(tasks[0].depends_on.is_empty());
    assert_eq!(tasks[1].depends_on, vec![number("1.1.1")]);
    assert_eq!(tasks[2].depends_on, vec![number("1.1.2")]);
    assert_eq!(tasks[3].depends_on, vec![number("1.1.3")]);
    assert!(tasks.iter().all(|t| t.status == WorkStatus::Pending));
}
