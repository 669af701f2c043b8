//! Point-in-time checkpoints and restore.
//!
//! A checkpoint bundles four things:
//!
//! - a workspace reference (a git commit of the project tree)
//! - a JSON backup of the durable state (project counters, issues, tasks, blockers)
//! - a JSON snapshot of every agent's context working set, archive references included
//! - metadata (trigger, counts, cost)
//!
//! Both JSON artifacts live under `.foreman/checkpoints/` and are hashed with
//! SHA-256. The database row is written last, so a checkpoint is never
//! registered unless every artifact exists. Rows are never updated.

mod manager;
mod workspace;

pub use manager::{CheckpointManager, RestoreOutcome, RestorePreview};
pub use workspace::{GitWorkspace, Workspace};

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a checkpoint was taken. Behavior is identical for every trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckpointTrigger {
    Manual,
    Pause,
    PreCompaction,
    Scheduled,
}

impl CheckpointTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Pause => "pause",
            Self::PreCompaction => "pre-compaction",
            Self::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for CheckpointTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "pause" => Ok(Self::Pause),
            "pre-compaction" => Ok(Self::PreCompaction),
            "scheduled" => Ok(Self::Scheduled),
            _ => Err(format!("Invalid checkpoint trigger: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub tasks_completed: usize,
    pub tasks_total: usize,
    pub agents_active: Vec<String>,
    pub context_items: usize,
    pub archived_items: usize,
    pub last_task_completed: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub note: Option<String>,
}

/// Checkpoint row as written; the store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCheckpoint {
    pub project_id: i64,
    pub trigger: CheckpointTrigger,
    pub git_ref: String,
    /// File name of the state backup, relative to the checkpoint directory.
    pub state_backup_ref: String,
    pub state_sha256: String,
    /// File name of the context snapshot, relative to the checkpoint directory.
    pub context_snapshot_ref: String,
    pub context_sha256: String,
    pub metadata: CheckpointMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: i64,
    pub project_id: i64,
    pub trigger: CheckpointTrigger,
    pub git_ref: String,
    pub state_backup_ref: String,
    pub state_sha256: String,
    pub context_snapshot_ref: String,
    pub context_sha256: String,
    pub metadata: CheckpointMetadata,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_names() {
        assert_eq!(CheckpointTrigger::PreCompaction.as_str(), "pre-compaction");
        assert_eq!(
            serde_json::to_string(&CheckpointTrigger::PreCompaction).unwrap(),
            "\"pre-compaction\""
        );
        for t in [
            CheckpointTrigger::Manual,
            CheckpointTrigger::Pause,
            CheckpointTrigger::PreCompaction,
            CheckpointTrigger::Scheduled,
        ] {
            assert_eq!(t.as_str().parse::<CheckpointTrigger>(), Ok(t));
        }
        assert!("nightly".parse::<CheckpointTrigger>().is_err());
    }
}
