use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agents::Usage;
use crate::breakdown::{Issue, WorkNumber};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerStatus {
    Open,
    Resolved,
}

impl BlockerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
        }
    }
}

impl FromStr for BlockerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "resolved" => Ok(Self::Resolved),
            _ => Err(format!("Invalid blocker status: {}", s)),
        }
    }
}

/// A question escalated to a human for a task that cannot proceed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blocker {
    pub id: i64,
    pub project_id: i64,
    pub task_id: Uuid,
    pub task_number: WorkNumber,
    pub question: String,
    pub answer: Option<String>,
    pub status: BlockerStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

pub const STATE_BACKUP_VERSION: u32 = 1;

/// Serialized copy of the mutable project state, written into checkpoints.
///
/// Audit tables (evidence, checkpoints, context archive) are append-only and
/// are not part of the backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateBackup {
    pub version: u32,
    pub project_id: i64,
    pub scope: u32,
    pub usage: Usage,
    pub issues: Vec<Issue>,
    pub blockers: Vec<Blocker>,
    pub exported_at: DateTime<Utc>,
}

impl StateBackup {
    /// Compare the restorable content, ignoring the export timestamp.
    pub fn same_state(&self, other: &StateBackup) -> bool {
        self.project_id == other.project_id
            && self.scope == other.scope
            && self.usage == other.usage
            && self.issues == other.issues
            && self.blockers == other.blockers
    }
}
