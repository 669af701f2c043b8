//! Best-effort notification of state changes.
//!
//! The core emits [`ProjectEvent`]s through an [`EventBus`]; sinks implement
//! [`Notifier`]. Delivery never blocks or fails the transition that caused
//! it: sink errors are logged and dropped.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ProjectPaused,
    ProjectResumed,
    ProjectStopped,
    ProjectCompleted,
    TaskStarted,
    TaskCompleted,
    TaskBlocked,
    TaskFailed,
    IssueCompleted,
    IssueFailed,
    CheckpointCreated,
    CheckpointRestored,
    FlashSaveCompleted,
    AgentSpawned,
    AgentTerminated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProjectPaused => "project_paused",
            Self::ProjectResumed => "project_resumed",
            Self::ProjectStopped => "project_stopped",
            Self::ProjectCompleted => "project_completed",
            Self::TaskStarted => "task_started",
            Self::TaskCompleted => "task_completed",
            Self::TaskBlocked => "task_blocked",
            Self::TaskFailed => "task_failed",
            Self::IssueCompleted => "issue_completed",
            Self::IssueFailed => "issue_failed",
            Self::CheckpointCreated => "checkpoint_created",
            Self::CheckpointRestored => "checkpoint_restored",
            Self::FlashSaveCompleted => "flash_save_completed",
            Self::AgentSpawned => "agent_spawned",
            Self::AgentTerminated => "agent_terminated",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub project_id: i64,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl ProjectEvent {
    pub fn new(event_type: EventType, project_id: i64, payload: Value) -> Self {
        Self {
            event_type,
            project_id,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// A sink for project events.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &ProjectEvent) -> anyhow::Result<()>;
}

/// Fan-out to every registered notifier.
#[derive(Clone, Default)]
pub struct EventBus {
    notifiers: Arc<Vec<Arc<dyn Notifier>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        let mut notifiers: Vec<Arc<dyn Notifier>> = self.notifiers.iter().cloned().collect();
        notifiers.push(notifier);
        self.notifiers = Arc::new(notifiers);
        self
    }

    pub fn emit(&self, event_type: EventType, project_id: i64, payload: Value) {
        let event = ProjectEvent::new(event_type, project_id, payload);
        tracing::debug!(project_id, event = %event_type, "Emitting event");
        for notifier in self.notifiers.iter() {
            if let Err(e) = notifier.notify(&event) {
                tracing::warn!(project_id, event = %event_type, error = %e, "Event delivery failed");
            }
        }
    }
}

/// Publishes events as JSON on a broadcast channel.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<String>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, event: &ProjectEvent) -> anyhow::Result<()> {
        let json = serde_json::to_string(event)?;
        // No receivers is not an error.
        let _ = self.tx.send(json);
        Ok(())
    }
}

/// Writes each event as a structured log line.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &ProjectEvent) -> anyhow::Result<()> {
        tracing::info!(
            project_id = event.project_id,
            event = %event.event_type,
            payload = %event.payload,
            "Project event"
        );
        Ok(())
    }
}
