use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::number::WorkNumber;
use crate::errors::ForemanError;

/// Status shared by issues and tasks. Issues never enter `Blocked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            _ => Err(format!("Invalid work status: {}", s)),
        }
    }
}

/// Bounded ordinal priority, 0 (most urgent) to 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const MAX: u8 = 4;
    pub const CRITICAL: Priority = Priority(0);
    pub const HIGH: Priority = Priority(1);
    pub const MEDIUM: Priority = Priority(2);
    pub const LOW: Priority = Priority(3);
    pub const NICE_TO_HAVE: Priority = Priority(4);

    pub fn new(value: u8) -> Result<Self, ForemanError> {
        if value > Self::MAX {
            return Err(ForemanError::validation(format!(
                "priority {value} is outside 0-{}",
                Self::MAX
            )));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    /// Derive a priority from free text.
    ///
    /// Keyword groups are checked in order; the first match wins.
    pub fn from_text(text: &str) -> Self {
        const RULES: &[(&[&str], Priority)] = &[
            (&["critical", "urgent", "must have"], Priority::CRITICAL),
            (&["high", "important"], Priority::HIGH),
            (&["low", "optional"], Priority::LOW),
            (&["nice to have", "nice-to-have"], Priority::NICE_TO_HAVE),
        ];
        let lower = text.to_lowercase();
        RULES
            .iter()
            .find(|(keywords, _)| keywords.iter().any(|k| lower.contains(k)))
            .map(|(_, p)| *p)
            .unwrap_or_default()
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::MEDIUM
    }
}

impl TryFrom<u8> for Priority {
    type Error = ForemanError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.0
    }
}

/// The atomic, assignable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Stable identity; survives renumbering.
    pub id: Uuid,
    pub number: WorkNumber,
    pub parent_issue: WorkNumber,
    pub title: String,
    pub description: String,
    pub status: WorkStatus,
    pub depends_on: Vec<WorkNumber>,
    pub attempts: u32,
    pub assigned_agent: Option<String>,
    /// Human-readable reason for the current blocked/failed status.
    pub reason: Option<String>,
    /// Thresholds missed by the latest rejected verification.
    #[serde(default)]
    pub violations: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(parent_issue: &WorkNumber, index: u32, title: &str, description: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            number: parent_issue.child(index),
            parent_issue: parent_issue.clone(),
            title: title.to_string(),
            description: description.to_string(),
            status: WorkStatus::Pending,
            depends_on: Vec::new(),
            attempts: 0,
            assigned_agent: None,
            reason: None,
            violations: Vec::new(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Tasks inside one issue never run in parallel.
    pub fn can_parallelize(&self) -> bool {
        false
    }
}

/// A unit of work large enough to require decomposition into tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: Uuid,
    pub number: WorkNumber,
    pub title: String,
    pub description: String,
    pub status: WorkStatus,
    pub priority: Priority,
    pub workflow_step: u32,
    pub tasks: Vec<Task>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Issue {
    pub fn new(number: WorkNumber, title: &str, description: &str, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4(),
            number,
            title: title.to_string(),
            description: description.to_string(),
            status: WorkStatus::Pending,
            priority,
            workflow_step: 1,
            tasks: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn task(&self, number: &WorkNumber) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.number == number)
    }

    /// First task not yet completed, in sequence order.
    pub fn next_task(&self) -> Option<&Task> {
        self.tasks
            .iter()
            .find(|t| t.status != WorkStatus::Completed)
    }

    pub fn all_tasks_completed(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| t.status == WorkStatus::Completed)
    }
}
