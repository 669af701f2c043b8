//! Working-memory items and their compact archive references.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Approximate characters per token for budget estimates.
pub const CHARS_PER_TOKEN: usize = 4;

/// Fixed token cost of an archive reference on top of its summary.
pub const REFERENCE_OVERHEAD_TOKENS: usize = 8;

/// Summary length kept in an archive reference.
const SUMMARY_CHARS: usize = 80;

/// Estimate token count for a piece of text.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Relevance tier. Ordered from most to least relevant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextTier {
    Hot,
    Warm,
    Cold,
}

impl ContextTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
        }
    }
}

impl fmt::Display for ContextTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hot" => Ok(Self::Hot),
            "warm" => Ok(Self::Warm),
            "cold" => Ok(Self::Cold),
            _ => Err(format!("Invalid context tier: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Message,
    FileExcerpt,
    ToolResult,
    TaskSpec,
    TestResult,
    Note,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::FileExcerpt => "file_excerpt",
            Self::ToolResult => "tool_result",
            Self::TaskSpec => "task_spec",
            Self::TestResult => "test_result",
            Self::Note => "note",
        }
    }
}

/// One unit of an agent's working memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub id: Uuid,
    pub agent_id: String,
    pub kind: ItemKind,
    pub content: String,
    pub tier: ContextTier,
    pub tokens: usize,
    /// Agent turn in which the item was last referenced.
    pub last_referenced_turn: u64,
    pub created_at: DateTime<Utc>,
    pub last_referenced_at: DateTime<Utc>,
}

impl ContextItem {
    pub fn new(agent_id: &str, kind: ItemKind, content: impl Into<String>, turn: u64) -> Self {
        let content = content.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.to_string(),
            kind,
            tokens: estimate_tokens(&content),
            content,
            tier: ContextTier::Hot,
            last_referenced_turn: turn,
            created_at: now,
            last_referenced_at: now,
        }
    }

    pub fn turns_unreferenced(&self, current_turn: u64) -> u64 {
        current_turn.saturating_sub(self.last_referenced_turn)
    }
}

/// Stand-in for an archived item inside the working set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRef {
    pub archive_id: Uuid,
    pub item_id: Uuid,
    pub kind: ItemKind,
    /// Token size of the archived content.
    pub archived_tokens: usize,
    pub summary: String,
}

impl ArchiveRef {
    pub fn for_item(archive_id: Uuid, item: &ContextItem) -> Self {
        let mut summary: String = item.content.chars().take(SUMMARY_CHARS).collect();
        if item.content.chars().count() > SUMMARY_CHARS {
            summary.push_str("...");
        }
        Self {
            archive_id,
            item_id: item.id,
            kind: item.kind,
            archived_tokens: item.tokens,
            summary,
        }
    }

    pub fn tokens(&self) -> usize {
        estimate_tokens(&self.summary) + REFERENCE_OVERHEAD_TOKENS
    }
}

/// A slot in an agent's ordered working set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ContextEntry {
    Live(ContextItem),
    Archived(ArchiveRef),
}

impl ContextEntry {
    pub fn tokens(&self) -> usize {
        match self {
            Self::Live(item) => item.tokens,
            Self::Archived(reference) => reference.tokens(),
        }
    }

    pub fn item_id(&self) -> Uuid {
        match self {
            Self::Live(item) => item.id,
            Self::Archived(reference) => reference.item_id,
        }
    }
}
