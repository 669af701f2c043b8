use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AgentKind, AgentRole, AgentState};
use crate::breakdown::WorkNumber;
use crate::errors::ForemanError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub role: AgentRole,
    pub kind: AgentKind,
    /// Direct superior; `None` means the lead.
    pub parent: Option<String>,
    pub state: AgentState,
    pub current_task: Option<WorkNumber>,
    pub specialization: Option<String>,
    /// Kept alive after reporting for reuse.
    pub retained: bool,
    pub tasks_completed: u32,
    pub created_at: DateTime<Utc>,
}

/// The agent tree, keyed by id. Owned and written only by the lead.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    max_agents: usize,
    agents: BTreeMap<String, AgentRecord>,
    counters: HashMap<String, u32>,
}

impl AgentRegistry {
    pub fn new(max_agents: usize) -> Self {
        Self {
            max_agents,
            agents: BTreeMap::new(),
            counters: HashMap::new(),
        }
    }

    fn next_index(&mut self, key: &str) -> u32 {
        let counter = self.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    fn ensure_capacity(&self) -> Result<(), ForemanError> {
        let live = self.active_agents().len();
        if live >= self.max_agents {
            return Err(ForemanError::validation(format!(
                "agent limit reached ({live}/{})",
                self.max_agents
            )));
        }
        Ok(())
    }

    /// Reuse an idle worker of `role`, or register a new one.
    pub fn acquire_worker(&mut self, role: AgentRole) -> Result<String, ForemanError> {
        if let Some(idle) = self.agents.values().find(|a| {
            a.kind == AgentKind::Worker && a.role == role && a.state == AgentState::Idle
        }) {
            return Ok(idle.id.clone());
        }
        self.ensure_capacity()?;
        let index = self.next_index(role.as_str());
        let id = format!("{}-worker-{:03}", role.as_str(), index);
        self.insert(AgentRecord {
            id: id.clone(),
            role,
            kind: AgentKind::Worker,
            parent: None,
            state: AgentState::Idle,
            current_task: None,
            specialization: None,
            retained: false,
            tasks_completed: 0,
            created_at: Utc::now(),
        });
        tracing::info!(agent_id = %id, role = %role, "Worker registered");
        Ok(id)
    }

    /// Register a specialist under `parent`.
    pub fn spawn_subagent(
        &mut self,
        parent: &str,
        specialization: &str,
    ) -> Result<String, ForemanError> {
        let parent_record = self
            .agents
            .get(parent)
            .ok_or_else(|| ForemanError::not_found("agent", parent))?;
        if parent_record.state == AgentState::Terminated {
            return Err(ForemanError::validation(format!(
                "agent {parent} is terminated and cannot spawn subagents"
            )));
        }
        self.ensure_capacity()?;
        let index = self.next_index(parent);
        let id = format!("{parent}.sub-{index:03}");
        self.insert(AgentRecord {
            id: id.clone(),
            role: AgentRole::Specialist,
            kind: AgentKind::Subagent,
            parent: Some(parent.to_string()),
            state: AgentState::Busy,
            current_task: None,
            specialization: Some(specialization.to_string()),
            retained: false,
            tasks_completed: 0,
            created_at: Utc::now(),
        });
        tracing::info!(agent_id = %id, parent, specialization, "Subagent spawned");
        Ok(id)
    }

    fn insert(&mut self, record: AgentRecord) {
        self.agents.insert(record.id.clone(), record);
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut AgentRecord, ForemanError> {
        self.agents
            .get_mut(id)
            .ok_or_else(|| ForemanError::not_found("agent", id))
    }

    pub fn get(&self, id: &str) -> Option<&AgentRecord> {
        self.agents.get(id)
    }

    /// Give a worker its task. A worker holds at most one.
    pub fn assign(&mut self, id: &str, task: &WorkNumber) -> Result<(), ForemanError> {
        let record = self.get_mut(id)?;
        match (&record.current_task, record.state) {
            (_, AgentState::Terminated) => Err(ForemanError::validation(format!(
                "agent {id} is terminated"
            ))),
            (Some(current), _) if current != task => Err(ForemanError::validation(format!(
                "agent {id} already holds task {current}"
            ))),
            _ => {
                record.current_task = Some(task.clone());
                record.state = AgentState::Busy;
                Ok(())
            }
        }
    }

    /// Task finished; the worker keeps its identity for the next one.
    pub fn complete_task(&mut self, id: &str) -> Result<(), ForemanError> {
        let record = self.get_mut(id)?;
        record.current_task = None;
        record.tasks_completed += 1;
        Ok(())
    }

    /// Task is blocked; the worker stays assigned to it.
    pub fn mark_blocked(&mut self, id: &str) -> Result<(), ForemanError> {
        self.get_mut(id)?.state = AgentState::Blocked;
        Ok(())
    }

    pub fn mark_busy(&mut self, id: &str) -> Result<(), ForemanError> {
        self.get_mut(id)?.state = AgentState::Busy;
        Ok(())
    }

    /// Return the worker to the idle pool.
    pub fn release(&mut self, id: &str) -> Result<(), ForemanError> {
        let record = self.get_mut(id)?;
        if record.state != AgentState::Terminated {
            record.state = AgentState::Idle;
        }
        record.current_task = None;
        Ok(())
    }

    pub fn retain(&mut self, id: &str) -> Result<(), ForemanError> {
        let record = self.get_mut(id)?;
        record.retained = true;
        record.state = AgentState::Idle;
        Ok(())
    }

    /// Terminate an agent and every descendant. Returns the ids terminated.
    pub fn terminate(&mut self, id: &str) -> Result<Vec<String>, ForemanError> {
        if !self.agents.contains_key(id) {
            return Err(ForemanError::not_found("agent", id));
        }
        let mut stack = vec![id.to_string()];
        let mut terminated = Vec::new();
        while let Some(current) = stack.pop() {
            stack.extend(self.children(&current));
            if let Some(record) = self.agents.get_mut(&current)
                && record.state != AgentState::Terminated
            {
                record.state = AgentState::Terminated;
                record.current_task = None;
                terminated.push(current);
            }
        }
        Ok(terminated)
    }

    pub fn children(&self, parent: &str) -> Vec<String> {
        self.agents
            .values()
            .filter(|a| a.parent.as_deref() == Some(parent))
            .map(|a| a.id.clone())
            .collect()
    }

    /// Ids of every non-terminated agent.
    pub fn active_agents(&self) -> Vec<String> {
        self.agents
            .values()
            .filter(|a| a.state != AgentState::Terminated)
            .map(|a| a.id.clone())
            .collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &AgentRecord> {
        self.agents.values()
    }
}
