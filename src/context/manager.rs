use std::collections::{BTreeMap, HashMap};
use std::sync::MutexGuard;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::item::{ArchiveRef, ContextEntry, ContextItem, ContextTier, ItemKind};
use super::policy::{FlashSaveConfig, TierPolicy};
use crate::errors::ForemanError;
use crate::store::DbHandle;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentContextSnapshot {
    pub turn: u64,
    pub entries: Vec<ContextEntry>,
}

/// Every agent's working set at one instant, archive references included.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub project_id: i64,
    pub agents: BTreeMap<String, AgentContextSnapshot>,
}

impl ContextSnapshot {
    pub fn item_count(&self) -> usize {
        self.agents.values().map(|a| a.entries.len()).sum()
    }

    pub fn archived_count(&self) -> usize {
        self.agents
            .values()
            .flat_map(|a| a.entries.iter())
            .filter(|e| matches!(e, ContextEntry::Archived(_)))
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashSaveResult {
    pub agent_id: String,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub reduction_percentage: f64,
    pub items_archived: usize,
    pub hot_retained: usize,
    pub warm_retained: usize,
}

#[derive(Debug, Default)]
struct AgentContext {
    turn: u64,
    entries: Vec<ContextEntry>,
}

impl AgentContext {
    fn footprint(&self) -> usize {
        self.entries.iter().map(ContextEntry::tokens).sum()
    }

    fn live_mut(&mut self, item_id: Uuid) -> Option<&mut ContextItem> {
        self.entries.iter_mut().find_map(|e| match e {
            ContextEntry::Live(item) if item.id == item_id => Some(item),
            _ => None,
        })
    }

    fn count_live(&self, tier: ContextTier) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, ContextEntry::Live(item) if item.tier == tier))
            .count()
    }
}

/// Tiered working memory for every agent in a project.
///
/// Items start HOT, decay one sweep at a time through WARM to COLD as turns
/// pass without a reference, and jump back to the promotion tier when
/// referenced. A flash save archives every COLD item of one agent and leaves
/// an [`ArchiveRef`] in its slot, so nothing is ever discarded.
pub struct ContextManager {
    project_id: i64,
    db: DbHandle,
    policy: TierPolicy,
    flash: FlashSaveConfig,
    agents: std::sync::Mutex<HashMap<String, AgentContext>>,
    flash_lock: tokio::sync::Mutex<()>,
}

impl ContextManager {
    pub fn new(project_id: i64, db: DbHandle, policy: TierPolicy, flash: FlashSaveConfig) -> Self {
        Self {
            project_id,
            db,
            policy,
            flash,
            agents: std::sync::Mutex::new(HashMap::new()),
            flash_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn flash_config(&self) -> FlashSaveConfig {
        self.flash
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AgentContext>> {
        // Every mutation leaves the map consistent, so a poisoned lock is still usable.
        self.agents.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an item to an agent's working set as HOT.
    pub fn add_item(&self, agent_id: &str, kind: ItemKind, content: impl Into<String>) -> Uuid {
        let mut agents = self.lock();
        let ctx = agents.entry(agent_id.to_string()).or_default();
        let item = ContextItem::new(agent_id, kind, content, ctx.turn);
        let id = item.id;
        tracing::debug!(agent_id, item_id = %id, tokens = item.tokens, "Context item added");
        ctx.entries.push(ContextEntry::Live(item));
        id
    }

    /// Mark an item as used this turn, promoting it.
    pub fn reference(&self, agent_id: &str, item_id: Uuid) -> Result<ContextTier, ForemanError> {
        let mut agents = self.lock();
        let ctx = agents
            .get_mut(agent_id)
            .ok_or_else(|| ForemanError::not_found("agent context", agent_id))?;
        let turn = ctx.turn;
        let tier = self.policy.promote_to.tier();
        let item = ctx
            .live_mut(item_id)
            .ok_or_else(|| ForemanError::not_found("live context item", item_id))?;
        item.tier = tier;
        item.last_referenced_turn = turn;
        item.last_referenced_at = Utc::now();
        Ok(tier)
    }

    /// Advance the agent's turn counter and re-tier every live item.
    pub fn end_turn(&self, agent_id: &str) -> u64 {
        let mut agents = self.lock();
        let ctx = agents.entry(agent_id.to_string()).or_default();
        ctx.turn += 1;
        let turn = ctx.turn;
        for entry in &mut ctx.entries {
            if let ContextEntry::Live(item) = entry {
                item.tier = self
                    .policy
                    .decay(item.tier, item.turns_unreferenced(turn));
            }
        }
        turn
    }

    /// Estimated tokens of the agent's working set, archive references included.
    pub fn footprint(&self, agent_id: &str) -> usize {
        self.lock().get(agent_id).map_or(0, AgentContext::footprint)
    }

    pub fn should_flash_save(&self, agent_id: &str) -> bool {
        self.flash.should_flash_save(self.footprint(agent_id))
    }

    /// Archive every COLD item of the agent.
    ///
    /// Entries are only replaced after the archive write commits; if it
    /// fails the working set is untouched. With nothing COLD this is a no-op
    /// reporting zero reduction.
    pub async fn flash_save(&self, agent_id: &str) -> Result<FlashSaveResult, ForemanError> {
        let _serial = self.flash_lock.lock().await;

        let (tokens_before, batch) = {
            let agents = self.lock();
            let Some(ctx) = agents.get(agent_id) else {
                return Ok(FlashSaveResult {
                    agent_id: agent_id.to_string(),
                    tokens_before: 0,
                    tokens_after: 0,
                    reduction_percentage: 0.0,
                    items_archived: 0,
                    hot_retained: 0,
                    warm_retained: 0,
                });
            };
            let batch: Vec<(Uuid, ContextItem)> = ctx
                .entries
                .iter()
                .filter_map(|e| match e {
                    ContextEntry::Live(item) if item.tier == ContextTier::Cold => {
                        Some((Uuid::new_v4(), item.clone()))
                    }
                    _ => None,
                })
                .collect();
            (ctx.footprint(), batch)
        };

        if !batch.is_empty() {
            let project_id = self.project_id;
            let to_archive = batch.clone();
            self.db
                .persist(move |db| db.archive_context_items(project_id, &to_archive))
                .await?;
        }

        let mut agents = self.lock();
        let ctx = agents.entry(agent_id.to_string()).or_default();
        let mut archived = 0;
        for (archive_id, item) in &batch {
            if let Some(slot) = ctx
                .entries
                .iter_mut()
                .find(|e| matches!(e, ContextEntry::Live(live) if live.id == item.id))
            {
                *slot = ContextEntry::Archived(ArchiveRef::for_item(*archive_id, item));
                archived += 1;
            }
        }
        let tokens_after = ctx.footprint();
        let reduction_percentage = if tokens_before == 0 {
            0.0
        } else {
            tokens_before.saturating_sub(tokens_after) as f64 / tokens_before as f64 * 100.0
        };
        let result = FlashSaveResult {
            agent_id: agent_id.to_string(),
            tokens_before,
            tokens_after,
            reduction_percentage,
            items_archived: archived,
            hot_retained: ctx.count_live(ContextTier::Hot),
            warm_retained: ctx.count_live(ContextTier::Warm),
        };
        tracing::info!(
            agent_id,
            tokens_before,
            tokens_after,
            items_archived = archived,
            "Flash save complete"
        );
        Ok(result)
    }

    /// Bring an archived item back into the working set as WARM, in place.
    pub async fn restore_archived(
        &self,
        agent_id: &str,
        archive_id: Uuid,
    ) -> Result<ContextItem, ForemanError> {
        {
            let agents = self.lock();
            let present = agents.get(agent_id).is_some_and(|ctx| {
                ctx.entries
                    .iter()
                    .any(|e| matches!(e, ContextEntry::Archived(r) if r.archive_id == archive_id))
            });
            if !present {
                return Err(ForemanError::not_found("archive reference", archive_id));
            }
        }

        let mut item = self
            .db
            .persist(move |db| db.get_archived_item(archive_id))
            .await?
            .ok_or_else(|| ForemanError::not_found("archived context item", archive_id))?;

        let mut agents = self.lock();
        let ctx = agents
            .get_mut(agent_id)
            .ok_or_else(|| ForemanError::not_found("agent context", agent_id))?;
        let slot = ctx
            .entries
            .iter_mut()
            .find(|e| matches!(e, ContextEntry::Archived(r) if r.archive_id == archive_id))
            .ok_or_else(|| ForemanError::not_found("archive reference", archive_id))?;
        item.tier = ContextTier::Warm;
        item.last_referenced_turn = ctx.turn;
        item.last_referenced_at = Utc::now();
        *slot = ContextEntry::Live(item.clone());
        Ok(item)
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let agents = self.lock();
        ContextSnapshot {
            project_id: self.project_id,
            agents: agents
                .iter()
                .map(|(id, ctx)| {
                    (
                        id.clone(),
                        AgentContextSnapshot {
                            turn: ctx.turn,
                            entries: ctx.entries.clone(),
                        },
                    )
                })
                .collect(),
        }
    }

    /// Replace every working set with the snapshot's.
    pub fn restore_snapshot(&self, snapshot: &ContextSnapshot) -> Result<(), ForemanError> {
        if snapshot.project_id != self.project_id {
            return Err(ForemanError::validation(format!(
                "context snapshot belongs to project {}, not {}",
                snapshot.project_id, self.project_id
            )));
        }
        let mut agents = self.lock();
        *agents = snapshot
            .agents
            .iter()
            .map(|(id, s)| {
                (
                    id.clone(),
                    AgentContext {
                        turn: s.turn,
                        entries: s.entries.clone(),
                    },
                )
            })
            .collect();
        Ok(())
    }

    /// Agent ids with a working set, sorted.
    pub fn agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn entries(&self, agent_id: &str) -> Vec<ContextEntry> {
        self.lock()
            .get(agent_id)
            .map(|ctx| ctx.entries.clone())
            .unwrap_or_default()
    }

    /// Live items of the agent, most recently referenced first.
    pub fn live_items(&self, agent_id: &str) -> Vec<ContextItem> {
        let mut items: Vec<ContextItem> = self
            .entries(agent_id)
            .into_iter()
            .filter_map(|e| match e {
                ContextEntry::Live(item) => Some(item),
                ContextEntry::Archived(_) => None,
            })
            .collect();
        items.sort_by(|a, b| b.last_referenced_turn.cmp(&a.last_referenced_turn));
        items
    }

    pub fn is_empty(&self) -> bool {
        self.lock().values().all(|ctx| ctx.entries.is_empty())
    }

    pub fn item_count(&self) -> usize {
        self.lock().values().map(|ctx| ctx.entries.len()).sum()
    }

    pub fn archived_count(&self) -> usize {
        self.lock()
            .values()
            .flat_map(|ctx| ctx.entries.iter())
            .filter(|e| matches!(e, ContextEntry::Archived(_)))
            .count()
    }
}
