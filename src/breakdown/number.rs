//! Dotted work numbers (`1.5`, `1.5.3`) as typed paths.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ForemanError;

/// Segments in an issue number: `{scope}.{index}`.
pub const ISSUE_DEPTH: usize = 2;
/// Segments in a task number: `{issue number}.{index}`.
pub const TASK_DEPTH: usize = 3;

/// A hierarchical identifier: an ordered sequence of 1-based indices.
///
/// Ordering is segment-wise numeric, so `1.10` sorts after `1.9` and a
/// parent sorts before all of its descendants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkNumber(Vec<u32>);

impl WorkNumber {
    pub fn new(segments: Vec<u32>) -> Result<Self, ForemanError> {
        if segments.is_empty() {
            return Err(ForemanError::validation("work number must not be empty"));
        }
        if segments.contains(&0) {
            return Err(ForemanError::validation(format!(
                "work number segments are 1-based: {}",
                join(&segments)
            )));
        }
        Ok(Self(segments))
    }

    /// Issue number `{scope}.{index}`.
    pub fn issue(scope: u32, index: u32) -> Result<Self, ForemanError> {
        Self::new(vec![scope, index])
    }

    /// Parse and require exactly [`ISSUE_DEPTH`] segments.
    pub fn parse_issue(s: &str) -> Result<Self, ForemanError> {
        let n: Self = s.parse()?;
        n.expect_depth(ISSUE_DEPTH, "issue")?;
        Ok(n)
    }

    /// Parse and require exactly [`TASK_DEPTH`] segments.
    pub fn parse_task(s: &str) -> Result<Self, ForemanError> {
        let n: Self = s.parse()?;
        n.expect_depth(TASK_DEPTH, "task")?;
        Ok(n)
    }

    pub fn expect_depth(&self, depth: usize, kind: &str) -> Result<(), ForemanError> {
        if self.depth() != depth {
            return Err(ForemanError::validation(format!(
                "{kind} number {self} must have {depth} segments"
            )));
        }
        Ok(())
    }

    pub fn segments(&self) -> &[u32] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_issue(&self) -> bool {
        self.depth() == ISSUE_DEPTH
    }

    pub fn is_task(&self) -> bool {
        self.depth() == TASK_DEPTH
    }

    /// Sequential position among siblings (the last segment).
    pub fn index(&self) -> u32 {
        // Non-empty by construction.
        self.0.last().copied().unwrap_or(1)
    }

    pub fn parent(&self) -> Option<WorkNumber> {
        if self.0.len() < 2 {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    pub fn child(&self, index: u32) -> WorkNumber {
        let mut segments = self.0.clone();
        segments.push(index.max(1));
        Self(segments)
    }

    /// Same parent prefix, different last segment.
    pub fn with_index(&self, index: u32) -> WorkNumber {
        let mut segments = self.0.clone();
        if let Some(last) = segments.last_mut() {
            *last = index.max(1);
        }
        Self(segments)
    }

    /// Strict ancestor check: `1.5` is a prefix of `1.5.3`, not of itself.
    pub fn is_prefix_of(&self, other: &WorkNumber) -> bool {
        self.0.len() < other.0.len() && other.0.starts_with(&self.0)
    }

    pub fn is_sibling_of(&self, other: &WorkNumber) -> bool {
        self != other && self.depth() == other.depth() && self.parent() == other.parent()
    }

    /// Whether two units may execute concurrently.
    ///
    /// Tasks sharing a parent issue are strictly sequential. Everything
    /// else that is distinct and not in an ancestor relation is
    /// parallel-eligible.
    pub fn can_run_parallel_with(&self, other: &WorkNumber) -> bool {
        if self == other || self.is_prefix_of(other) || other.is_prefix_of(self) {
            return false;
        }
        !(self.is_task() && other.is_task() && self.parent() == other.parent())
    }
}

fn join(segments: &[u32]) -> String {
    segments
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

impl fmt::Display for WorkNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&join(&self.0))
    }
}

impl FromStr for WorkNumber {
    type Err = ForemanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ForemanError::validation("work number must not be empty"));
        }
        let segments = trimmed
            .split('.')
            .map(|part| {
                part.parse::<u32>().map_err(|_| {
                    ForemanError::validation(format!("invalid work number '{s}'"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(segments)
    }
}

impl TryFrom<String> for WorkNumber {
    type Error = ForemanError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WorkNumber> for String {
    fn from(value: WorkNumber) -> Self {
        value.to_string()
    }
}
