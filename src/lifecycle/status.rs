use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::Usage;

/// Top-level project state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Init,
    Planning,
    Active,
    Paused,
    Stopped,
    Completed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Planning => "planning",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Completed)
    }

    /// Edges of the lifecycle graph. `Init` and `Planning` have no inbound
    /// edges, so neither can be re-entered.
    pub fn can_transition_to(&self, to: ProjectStatus) -> bool {
        use ProjectStatus::*;
        match (self, to) {
            (Init, Planning) | (Planning, Active) | (Active, Paused) => true,
            (Paused, Active) | (Paused, Stopped) => true,
            (from, Completed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(Self::Init),
            "planning" => Ok(Self::Planning),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "stopped" => Ok(Self::Stopped),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid project status: {}", s)),
        }
    }
}

/// Recorded when a project is paused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseMetadata {
    pub reason: String,
    pub checkpoint_id: i64,
    pub paused_at: DateTime<Utc>,
    /// Status the project held before pausing.
    pub previous_status: ProjectStatus,
}

/// Root aggregate for one delivery effort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub root_dir: String,
    /// Leading segment of every issue number.
    pub scope: u32,
    pub status: ProjectStatus,
    pub pause_metadata: Option<PauseMetadata>,
    pub usage: Usage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
