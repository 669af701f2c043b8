use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use super::models::{Blocker, BlockerStatus, STATE_BACKUP_VERSION, StateBackup};
use crate::agents::Usage;
use crate::breakdown::{Issue, Priority, Task, WorkBreakdown, WorkNumber, WorkStatus};
use crate::checkpoint::{Checkpoint, CheckpointMetadata, CheckpointTrigger, NewCheckpoint};
use crate::context::ContextItem;
use crate::errors::ForemanError;
use crate::evidence::{EvidenceRecord, NewEvidence, VerificationStatus};
use crate::lifecycle::{PauseMetadata, Project, ProjectStatus};

/// Async-safe handle to the state database.
///
/// Wraps `StateDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite
/// I/O off the async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<StateDb>>,
}

impl DbHandle {
    pub fn new(db: StateDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(StateDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(StateDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&StateDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Like [`DbHandle::call`], with failures mapped to `Persistence`.
    pub async fn persist<F, R>(&self, f: F) -> Result<R, ForemanError>
    where
        F: FnOnce(&StateDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.call(f).await.map_err(ForemanError::persistence)
    }

    /// Acquire the database mutex synchronously. For startup, CLI commands
    /// and tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, StateDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct StateDb {
    conn: Connection,
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp '{}'", s))?
        .with_timezone(&Utc))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_enum<T: FromStr<Err = String>>(s: &str, what: &str) -> Result<T> {
    T::from_str(s)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Failed to parse {}", what))
}

fn parse_number(s: &str) -> Result<WorkNumber> {
    WorkNumber::from_str(s).map_err(|e| anyhow::anyhow!("{}", e))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("Invalid uuid '{}'", s))
}

const PROJECT_COLUMNS: &str = "id, name, root_dir, scope, status, pause_metadata, input_tokens, \
     output_tokens, cost_usd, created_at, updated_at";

const TASK_COLUMNS: &str = "t.id, t.task_number, t.parent_issue_number, t.title, t.description, \
     t.status, t.depends_on, t.attempts, t.assigned_agent, t.reason, t.violations, t.started_at, \
     t.completed_at";

const EVIDENCE_COLUMNS: &str = "id, project_id, task_id, task_number, agent_id, attempt, \
     verification_status, test_results, coverage_pct, skip_violations, violations, created_at";

const CHECKPOINT_COLUMNS: &str = "id, project_id, trigger, git_ref, state_backup_ref, state_sha256, \
     context_snapshot_ref, context_sha256, metadata, created_at";

const BLOCKER_COLUMNS: &str =
    "id, project_id, task_id, task_number, question, answer, status, created_at, resolved_at";

impl StateDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                root_dir TEXT NOT NULL,
                scope INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'init',
                pause_metadata TEXT,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cost_usd REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS issues (
                id TEXT PRIMARY KEY,
                project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                issue_number TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending',
                priority INTEGER NOT NULL DEFAULT 2 CHECK (priority BETWEEN 0 AND 4),
                workflow_step INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                completed_at TEXT,
                UNIQUE(project_id, issue_number)
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                issue_id TEXT NOT NULL REFERENCES issues(id) ON DELETE CASCADE,
                task_number TEXT NOT NULL,
                parent_issue_number TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending',
                can_parallelize INTEGER NOT NULL DEFAULT 0 CHECK (can_parallelize = 0),
                depends_on TEXT NOT NULL DEFAULT '[]',
                attempts INTEGER NOT NULL DEFAULT 0,
                assigned_agent TEXT,
                reason TEXT,
                violations TEXT NOT NULL DEFAULT '[]',
                started_at TEXT,
                completed_at TEXT,
                UNIQUE(issue_id, task_number)
            );

            CREATE TABLE IF NOT EXISTS checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL REFERENCES projects(id),
                trigger TEXT NOT NULL,
                git_ref TEXT NOT NULL,
                state_backup_ref TEXT NOT NULL,
                state_sha256 TEXT NOT NULL,
                context_snapshot_ref TEXT NOT NULL,
                context_sha256 TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_evidence (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL,
                task_id TEXT NOT NULL,
                task_number TEXT NOT NULL,
                agent_id TEXT,
                attempt INTEGER NOT NULL,
                verification_status TEXT NOT NULL,
                test_results TEXT NOT NULL,
                coverage_pct REAL,
                skip_violations TEXT NOT NULL DEFAULT '[]',
                violations TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS context_archive (
                id TEXT PRIMARY KEY,
                project_id INTEGER NOT NULL,
                agent_id TEXT NOT NULL,
                item_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                tokens INTEGER NOT NULL,
                payload TEXT NOT NULL,
                archived_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS blockers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                task_id TEXT NOT NULL,
                task_number TEXT NOT NULL,
                question TEXT NOT NULL,
                answer TEXT,
                status TEXT NOT NULL DEFAULT 'open',
                created_at TEXT NOT NULL,
                resolved_at TEXT
            );

            CREATE TRIGGER IF NOT EXISTS task_evidence_no_update
                BEFORE UPDATE ON task_evidence
                BEGIN SELECT RAISE(ABORT, 'task_evidence is append-only'); END;
            CREATE TRIGGER IF NOT EXISTS task_evidence_no_delete
                BEFORE DELETE ON task_evidence
                BEGIN SELECT RAISE(ABORT, 'task_evidence is append-only'); END;
            CREATE TRIGGER IF NOT EXISTS checkpoints_no_update
                BEFORE UPDATE ON checkpoints
                BEGIN SELECT RAISE(ABORT, 'checkpoints are immutable'); END;

            CREATE INDEX IF NOT EXISTS idx_issues_project ON issues(project_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_issue ON tasks(issue_id);
            CREATE INDEX IF NOT EXISTS idx_checkpoints_project ON checkpoints(project_id);
            CREATE INDEX IF NOT EXISTS idx_evidence_task ON task_evidence(task_id);
            CREATE INDEX IF NOT EXISTS idx_archive_agent ON context_archive(project_id, agent_id);
            CREATE INDEX IF NOT EXISTS idx_blockers_project ON blockers(project_id, status);
            ",
        )?;
        Ok(())
    }

    /// Run raw SQL against the connection. Tests use this to install
    /// failure triggers.
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(&self, name: &str, root_dir: &str, scope: u32) -> Result<Project> {
        let now = ts(&Utc::now());
        self.conn
            .execute(
                "INSERT INTO projects (name, root_dir, scope, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![name, root_dir, scope, ProjectStatus::Init.as_str(), now],
            )
            .context("Failed to insert project")?;
        let id = self.conn.last_insert_rowid();
        self.get_project(id)?.context("Project not found after insert")
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects ORDER BY id");
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map([], ProjectRow::from_row)
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?.into_project()?);
        }
        Ok(projects)
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], ProjectRow::from_row)
            .optional()
            .context("Failed to query project")?;
        row.map(ProjectRow::into_project).transpose()
    }

    /// Atomically move a project from `expected` to `next`.
    ///
    /// Returns `false` (and writes nothing) when the stored status is not
    /// `expected`. `pause` replaces the stored pause metadata when given.
    pub fn compare_and_set_status(
        &self,
        id: i64,
        expected: ProjectStatus,
        next: ProjectStatus,
        pause: Option<&PauseMetadata>,
    ) -> Result<bool> {
        let pause_json = pause
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize pause metadata")?;
        let changed = self
            .conn
            .execute(
                "UPDATE projects
                 SET status = ?1, pause_metadata = COALESCE(?2, pause_metadata), updated_at = ?3
                 WHERE id = ?4 AND status = ?5",
                params![
                    next.as_str(),
                    pause_json,
                    ts(&Utc::now()),
                    id,
                    expected.as_str()
                ],
            )
            .context("Failed to update project status")?;
        Ok(changed == 1)
    }

    /// Unconditional status write, used to roll back a failed transition.
    pub fn set_status(&self, id: i64, status: ProjectStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE projects SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), ts(&Utc::now()), id],
            )
            .context("Failed to set project status")?;
        Ok(())
    }

    pub fn add_usage(&self, id: i64, usage: &Usage) -> Result<()> {
        self.conn
            .execute(
                "UPDATE projects
                 SET input_tokens = input_tokens + ?1, output_tokens = output_tokens + ?2,
                     cost_usd = cost_usd + ?3, updated_at = ?4
                 WHERE id = ?5",
                params![
                    usage.input_tokens as i64,
                    usage.output_tokens as i64,
                    usage.cost_usd,
                    ts(&Utc::now()),
                    id
                ],
            )
            .context("Failed to add project usage")?;
        Ok(())
    }

    // ── Work breakdown ────────────────────────────────────────────────

    /// Replace the project's issues and tasks in one transaction.
    pub fn save_breakdown(&self, project_id: i64, breakdown: &WorkBreakdown) -> Result<()> {
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        write_issues(&tx, project_id, breakdown.issues())?;
        tx.execute(
            "UPDATE projects SET scope = ?1, updated_at = ?2 WHERE id = ?3",
            params![breakdown.scope(), ts(&Utc::now()), project_id],
        )
        .context("Failed to update project scope")?;
        tx.commit().context("Failed to commit breakdown")?;
        Ok(())
    }

    pub fn load_breakdown(&self, project_id: i64) -> Result<WorkBreakdown> {
        let project = self
            .get_project(project_id)?
            .with_context(|| format!("Project {} not found", project_id))?;
        let issues = self.load_issues(project_id)?;
        WorkBreakdown::from_issues(project.scope, issues)
            .map_err(|e| anyhow::anyhow!("Stored work breakdown is invalid: {}", e))
    }

    fn load_issues(&self, project_id: i64) -> Result<Vec<Issue>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, issue_number, title, description, status, priority, workflow_step,
                        created_at, completed_at
                 FROM issues WHERE project_id = ?1",
            )
            .context("Failed to prepare load_issues")?;
        let rows = stmt
            .query_map(params![project_id], |row| {
                Ok(IssueRow {
                    id: row.get(0)?,
                    issue_number: row.get(1)?,
                    title: row.get(2)?,
                    description: row.get(3)?,
                    status: row.get(4)?,
                    priority: row.get(5)?,
                    workflow_step: row.get(6)?,
                    created_at: row.get(7)?,
                    completed_at: row.get(8)?,
                })
            })
            .context("Failed to query issues")?;
        let mut issues = Vec::new();
        for row in rows {
            let row = row.context("Failed to read issue row")?;
            let issue_id = row.id.clone();
            let mut issue = row.into_issue()?;
            issue.tasks = self.load_tasks(&issue_id)?;
            issues.push(issue);
        }
        Ok(issues)
    }

    fn load_tasks(&self, issue_id: &str) -> Result<Vec<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE t.issue_id = ?1");
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare load_tasks")?;
        let rows = stmt
            .query_map(params![issue_id], TaskRow::from_row)
            .context("Failed to query tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_task()?);
        }
        Ok(tasks)
    }

    /// Persist one issue's status fields.
    pub fn save_issue_status(&self, issue: &Issue) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE issues SET status = ?1, completed_at = ?2 WHERE id = ?3",
                params![
                    issue.status.as_str(),
                    issue.completed_at.as_ref().map(ts),
                    issue.id.to_string()
                ],
            )
            .context("Failed to update issue status")?;
        anyhow::ensure!(changed == 1, "Issue {} not found", issue.number);
        Ok(())
    }

    /// Persist one task's mutable fields.
    pub fn save_task(&self, task: &Task) -> Result<()> {
        let depends_on =
            serde_json::to_string(&task.depends_on).context("Failed to serialize depends_on")?;
        let violations =
            serde_json::to_string(&task.violations).context("Failed to serialize violations")?;
        let changed = self
            .conn
            .execute(
                "UPDATE tasks
                 SET task_number = ?1, status = ?2, depends_on = ?3, attempts = ?4,
                     assigned_agent = ?5, reason = ?6, violations = ?7, started_at = ?8,
                     completed_at = ?9
                 WHERE id = ?10",
                params![
                    task.number.to_string(),
                    task.status.as_str(),
                    depends_on,
                    task.attempts,
                    task.assigned_agent,
                    task.reason,
                    violations,
                    task.started_at.as_ref().map(ts),
                    task.completed_at.as_ref().map(ts),
                    task.id.to_string()
                ],
            )
            .context("Failed to update task")?;
        anyhow::ensure!(changed == 1, "Task {} not found", task.number);
        Ok(())
    }

    // ── Evidence (append-only) ────────────────────────────────────────

    pub fn insert_evidence(&self, evidence: &NewEvidence) -> Result<EvidenceRecord> {
        let test_results = serde_json::to_string(&evidence.test_results)
            .context("Failed to serialize test results")?;
        let skips = serde_json::to_string(&evidence.skip_violations)
            .context("Failed to serialize skip violations")?;
        let violations = serde_json::to_string(&evidence.violations)
            .context("Failed to serialize violations")?;
        self.conn
            .execute(
                "INSERT INTO task_evidence (project_id, task_id, task_number, agent_id, attempt,
                     verification_status, test_results, coverage_pct, skip_violations, violations,
                     created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    evidence.project_id,
                    evidence.task_id.to_string(),
                    evidence.task_number.to_string(),
                    evidence.agent_id,
                    evidence.attempt,
                    evidence.verification_status.as_str(),
                    test_results,
                    evidence.coverage_pct,
                    skips,
                    violations,
                    ts(&Utc::now())
                ],
            )
            .context("Failed to insert evidence record")?;
        let id = self.conn.last_insert_rowid();
        let sql = format!("SELECT {EVIDENCE_COLUMNS} FROM task_evidence WHERE id = ?1");
        self.conn
            .query_row(&sql, params![id], EvidenceRow::from_row)
            .context("Evidence record not found after insert")?
            .into_record()
    }

    /// Every record for a task, oldest first.
    pub fn list_evidence(&self, task_id: Uuid) -> Result<Vec<EvidenceRecord>> {
        let sql =
            format!("SELECT {EVIDENCE_COLUMNS} FROM task_evidence WHERE task_id = ?1 ORDER BY id");
        self.query_evidence(&sql, params![task_id.to_string()])
    }

    /// Every record filed under a task number in a project, oldest first.
    pub fn list_evidence_by_number(
        &self,
        project_id: i64,
        number: &WorkNumber,
    ) -> Result<Vec<EvidenceRecord>> {
        let sql = format!(
            "SELECT {EVIDENCE_COLUMNS} FROM task_evidence
             WHERE project_id = ?1 AND task_number = ?2 ORDER BY id"
        );
        self.query_evidence(&sql, params![project_id, number.to_string()])
    }

    fn query_evidence(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<EvidenceRecord>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare evidence query")?;
        let rows = stmt
            .query_map(params, EvidenceRow::from_row)
            .context("Failed to query evidence")?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("Failed to read evidence row")?.into_record()?);
        }
        Ok(records)
    }

    // ── Checkpoints (immutable) ───────────────────────────────────────

    pub fn insert_checkpoint(&self, checkpoint: &NewCheckpoint) -> Result<Checkpoint> {
        let metadata = serde_json::to_string(&checkpoint.metadata)
            .context("Failed to serialize checkpoint metadata")?;
        self.conn
            .execute(
                "INSERT INTO checkpoints (project_id, trigger, git_ref, state_backup_ref,
                     state_sha256, context_snapshot_ref, context_sha256, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    checkpoint.project_id,
                    checkpoint.trigger.as_str(),
                    checkpoint.git_ref,
                    checkpoint.state_backup_ref,
                    checkpoint.state_sha256,
                    checkpoint.context_snapshot_ref,
                    checkpoint.context_sha256,
                    metadata,
                    ts(&Utc::now())
                ],
            )
            .context("Failed to insert checkpoint")?;
        let id = self.conn.last_insert_rowid();
        self.get_checkpoint(id)?
            .context("Checkpoint not found after insert")
    }

    pub fn get_checkpoint(&self, id: i64) -> Result<Option<Checkpoint>> {
        let sql = format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], CheckpointRow::from_row)
            .optional()
            .context("Failed to query checkpoint")?;
        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    /// Checkpoints for a project, newest first.
    pub fn list_checkpoints(&self, project_id: i64) -> Result<Vec<Checkpoint>> {
        let sql = format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE project_id = ?1 ORDER BY id DESC"
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_checkpoints")?;
        let rows = stmt
            .query_map(params![project_id], CheckpointRow::from_row)
            .context("Failed to query checkpoints")?;
        let mut checkpoints = Vec::new();
        for row in rows {
            checkpoints.push(row.context("Failed to read checkpoint row")?.into_checkpoint()?);
        }
        Ok(checkpoints)
    }

    // ── Context archive ───────────────────────────────────────────────

    /// Archive items in one transaction; all or nothing.
    pub fn archive_context_items(&self, project_id: i64, items: &[(Uuid, ContextItem)]) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let now = ts(&Utc::now());
        for (archive_id, item) in items {
            let payload = serde_json::to_string(item).context("Failed to serialize context item")?;
            tx.execute(
                "INSERT INTO context_archive (id, project_id, agent_id, item_id, kind, tokens,
                     payload, archived_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    archive_id.to_string(),
                    project_id,
                    item.agent_id,
                    item.id.to_string(),
                    item.kind.as_str(),
                    item.tokens as i64,
                    payload,
                    now
                ],
            )
            .context("Failed to archive context item")?;
        }
        tx.commit().context("Failed to commit context archive")?;
        Ok(())
    }

    pub fn get_archived_item(&self, archive_id: Uuid) -> Result<Option<ContextItem>> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM context_archive WHERE id = ?1",
                params![archive_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query context archive")?;
        payload
            .map(|p| serde_json::from_str(&p).context("Failed to parse archived context item"))
            .transpose()
    }

    pub fn count_archived(&self, project_id: i64) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM context_archive WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .context("Failed to count context archive")?;
        Ok(count as usize)
    }

    // ── Blockers ──────────────────────────────────────────────────────

    pub fn create_blocker(&self, project_id: i64, task: &Task, question: &str) -> Result<Blocker> {
        self.conn
            .execute(
                "INSERT INTO blockers (project_id, task_id, task_number, question, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    project_id,
                    task.id.to_string(),
                    task.number.to_string(),
                    question,
                    BlockerStatus::Open.as_str(),
                    ts(&Utc::now())
                ],
            )
            .context("Failed to insert blocker")?;
        let id = self.conn.last_insert_rowid();
        self.get_blocker(id)?.context("Blocker not found after insert")
    }

    /// Record the answer to an open blocker.
    pub fn resolve_blocker(&self, id: i64, answer: &str) -> Result<Blocker> {
        let changed = self
            .conn
            .execute(
                "UPDATE blockers SET answer = ?1, status = ?2, resolved_at = ?3
                 WHERE id = ?4 AND status = ?5",
                params![
                    answer,
                    BlockerStatus::Resolved.as_str(),
                    ts(&Utc::now()),
                    id,
                    BlockerStatus::Open.as_str()
                ],
            )
            .context("Failed to resolve blocker")?;
        anyhow::ensure!(changed == 1, "Blocker {} is not open", id);
        self.get_blocker(id)?.context("Blocker not found after update")
    }

    pub fn get_blocker(&self, id: i64) -> Result<Option<Blocker>> {
        let sql = format!("SELECT {BLOCKER_COLUMNS} FROM blockers WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], BlockerRow::from_row)
            .optional()
            .context("Failed to query blocker")?;
        row.map(BlockerRow::into_blocker).transpose()
    }

    pub fn list_blockers(&self, project_id: i64, open_only: bool) -> Result<Vec<Blocker>> {
        let sql = if open_only {
            format!(
                "SELECT {BLOCKER_COLUMNS} FROM blockers WHERE project_id = ?1 AND status = 'open' ORDER BY id"
            )
        } else {
            format!("SELECT {BLOCKER_COLUMNS} FROM blockers WHERE project_id = ?1 ORDER BY id")
        };
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_blockers")?;
        let rows = stmt
            .query_map(params![project_id], BlockerRow::from_row)
            .context("Failed to query blockers")?;
        let mut blockers = Vec::new();
        for row in rows {
            blockers.push(row.context("Failed to read blocker row")?.into_blocker()?);
        }
        Ok(blockers)
    }

    // ── State backup ──────────────────────────────────────────────────

    pub fn export_state(&self, project_id: i64) -> Result<StateBackup> {
        let project = self
            .get_project(project_id)?
            .with_context(|| format!("Project {} not found", project_id))?;
        let mut issues = self.load_issues(project_id)?;
        issues.sort_by(|a, b| a.number.cmp(&b.number));
        for issue in &mut issues {
            issue.tasks.sort_by(|a, b| a.number.cmp(&b.number));
        }
        Ok(StateBackup {
            version: STATE_BACKUP_VERSION,
            project_id,
            scope: project.scope,
            usage: project.usage,
            issues,
            blockers: self.list_blockers(project_id, false)?,
            exported_at: Utc::now(),
        })
    }

    /// Replace the project's mutable state with `backup` in one transaction.
    ///
    /// `before_commit` runs after every row is written but before commit; if
    /// it fails the transaction rolls back and nothing changes.
    pub fn restore_state_with<F>(&self, backup: &StateBackup, before_commit: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        anyhow::ensure!(
            backup.version == STATE_BACKUP_VERSION,
            "Unsupported state backup version {}",
            backup.version
        );
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        write_issues(&tx, backup.project_id, &backup.issues)?;
        let changed = tx
            .execute(
                "UPDATE projects
                 SET scope = ?1, input_tokens = ?2, output_tokens = ?3, cost_usd = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    backup.scope,
                    backup.usage.input_tokens as i64,
                    backup.usage.output_tokens as i64,
                    backup.usage.cost_usd,
                    ts(&Utc::now()),
                    backup.project_id
                ],
            )
            .context("Failed to restore project counters")?;
        anyhow::ensure!(changed == 1, "Project {} not found", backup.project_id);
        tx.execute(
            "DELETE FROM blockers WHERE project_id = ?1",
            params![backup.project_id],
        )
        .context("Failed to clear blockers")?;
        for b in &backup.blockers {
            tx.execute(
                "INSERT INTO blockers (id, project_id, task_id, task_number, question, answer,
                     status, created_at, resolved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    b.id,
                    b.project_id,
                    b.task_id.to_string(),
                    b.task_number.to_string(),
                    b.question,
                    b.answer,
                    b.status.as_str(),
                    ts(&b.created_at),
                    b.resolved_at.as_ref().map(ts)
                ],
            )
            .context("Failed to restore blocker")?;
        }
        before_commit()?;
        tx.commit().context("Failed to commit state restore")?;
        Ok(())
    }
}

fn write_issues(conn: &Connection, project_id: i64, issues: &[Issue]) -> Result<()> {
    conn.execute("DELETE FROM issues WHERE project_id = ?1", params![project_id])
        .context("Failed to clear issues")?;
    for issue in issues {
        conn.execute(
            "INSERT INTO issues (id, project_id, issue_number, title, description, status,
                 priority, workflow_step, created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                issue.id.to_string(),
                project_id,
                issue.number.to_string(),
                issue.title,
                issue.description,
                issue.status.as_str(),
                issue.priority.value(),
                issue.workflow_step,
                ts(&issue.created_at),
                issue.completed_at.as_ref().map(ts)
            ],
        )
        .with_context(|| format!("Failed to insert issue {}", issue.number))?;
        for task in &issue.tasks {
            let depends_on = serde_json::to_string(&task.depends_on)
                .context("Failed to serialize depends_on")?;
            let violations = serde_json::to_string(&task.violations)
                .context("Failed to serialize violations")?;
            conn.execute(
                "INSERT INTO tasks (id, issue_id, task_number, parent_issue_number, title,
                     description, status, can_parallelize, depends_on, attempts, assigned_agent,
                     reason, violations, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    task.id.to_string(),
                    issue.id.to_string(),
                    task.number.to_string(),
                    task.parent_issue.to_string(),
                    task.title,
                    task.description,
                    task.status.as_str(),
                    task.can_parallelize(),
                    depends_on,
                    task.attempts,
                    task.assigned_agent,
                    task.reason,
                    violations,
                    task.started_at.as_ref().map(ts),
                    task.completed_at.as_ref().map(ts)
                ],
            )
            .with_context(|| format!("Failed to insert task {}", task.number))?;
        }
    }
    Ok(())
}

// ── Row conversion ────────────────────────────────────────────────────

/// Intermediate row struct for projects.
struct ProjectRow {
    id: i64,
    name: String,
    root_dir: String,
    scope: u32,
    status: String,
    pause_metadata: Option<String>,
    input_tokens: i64,
    output_tokens: i64,
    cost_usd: f64,
    created_at: String,
    updated_at: String,
}

impl ProjectRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            root_dir: row.get(2)?,
            scope: row.get(3)?,
            status: row.get(4)?,
            pause_metadata: row.get(5)?,
            input_tokens: row.get(6)?,
            output_tokens: row.get(7)?,
            cost_usd: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_project(self) -> Result<Project> {
        let pause_metadata = self
            .pause_metadata
            .as_deref()
            .map(serde_json::from_str::<PauseMetadata>)
            .transpose()
            .context("Failed to parse pause metadata")?;
        Ok(Project {
            id: self.id,
            name: self.name,
            root_dir: self.root_dir,
            scope: self.scope,
            status: parse_enum(&self.status, "project status")?,
            pause_metadata,
            usage: Usage {
                input_tokens: self.input_tokens.max(0) as u64,
                output_tokens: self.output_tokens.max(0) as u64,
                cost_usd: self.cost_usd,
            },
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

/// Intermediate row struct for issues.
struct IssueRow {
    id: String,
    issue_number: String,
    title: String,
    description: String,
    status: String,
    priority: u8,
    workflow_step: u32,
    created_at: String,
    completed_at: Option<String>,
}

impl IssueRow {
    fn into_issue(self) -> Result<Issue> {
        Ok(Issue {
            id: parse_uuid(&self.id)?,
            number: parse_number(&self.issue_number)?,
            title: self.title,
            description: self.description,
            status: parse_enum::<WorkStatus>(&self.status, "issue status")?,
            priority: Priority::new(self.priority).map_err(|e| anyhow::anyhow!("{}", e))?,
            workflow_step: self.workflow_step,
            tasks: Vec::new(),
            created_at: parse_ts(&self.created_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
        })
    }
}

/// Intermediate row struct for tasks.
struct TaskRow {
    id: String,
    task_number: String,
    parent_issue_number: String,
    title: String,
    description: String,
    status: String,
    depends_on: String,
    attempts: u32,
    assigned_agent: Option<String>,
    reason: Option<String>,
    violations: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_number: row.get(1)?,
            parent_issue_number: row.get(2)?,
            title: row.get(3)?,
            description: row.get(4)?,
            status: row.get(5)?,
            depends_on: row.get(6)?,
            attempts: row.get(7)?,
            assigned_agent: row.get(8)?,
            reason: row.get(9)?,
            violations: row.get(10)?,
            started_at: row.get(11)?,
            completed_at: row.get(12)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        Ok(Task {
            id: parse_uuid(&self.id)?,
            number: parse_number(&self.task_number)?,
            parent_issue: parse_number(&self.parent_issue_number)?,
            title: self.title,
            description: self.description,
            status: parse_enum::<WorkStatus>(&self.status, "task status")?,
            depends_on: serde_json::from_str(&self.depends_on)
                .context("Failed to parse task depends_on JSON")?,
            attempts: self.attempts,
            assigned_agent: self.assigned_agent,
            reason: self.reason,
            violations: serde_json::from_str(&self.violations)
                .context("Failed to parse task violations JSON")?,
            started_at: parse_opt_ts(self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
        })
    }
}

/// Intermediate row struct for task_evidence.
struct EvidenceRow {
    id: i64,
    project_id: i64,
    task_id: String,
    task_number: String,
    agent_id: Option<String>,
    attempt: u32,
    verification_status: String,
    test_results: String,
    coverage_pct: Option<f64>,
    skip_violations: String,
    violations: String,
    created_at: String,
}

impl EvidenceRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            task_id: row.get(2)?,
            task_number: row.get(3)?,
            agent_id: row.get(4)?,
            attempt: row.get(5)?,
            verification_status: row.get(6)?,
            test_results: row.get(7)?,
            coverage_pct: row.get(8)?,
            skip_violations: row.get(9)?,
            violations: row.get(10)?,
            created_at: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<EvidenceRecord> {
        Ok(EvidenceRecord {
            id: self.id,
            project_id: self.project_id,
            task_id: parse_uuid(&self.task_id)?,
            task_number: parse_number(&self.task_number)?,
            agent_id: self.agent_id,
            attempt: self.attempt,
            verification_status: parse_enum::<VerificationStatus>(
                &self.verification_status,
                "verification status",
            )?,
            test_results: serde_json::from_str(&self.test_results)
                .context("Failed to parse test results JSON")?,
            coverage_pct: self.coverage_pct,
            skip_violations: serde_json::from_str(&self.skip_violations)
                .context("Failed to parse skip violations JSON")?,
            violations: serde_json::from_str(&self.violations)
                .context("Failed to parse violations JSON")?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

/// Intermediate row struct for checkpoints.
struct CheckpointRow {
    id: i64,
    project_id: i64,
    trigger: String,
    git_ref: String,
    state_backup_ref: String,
    state_sha256: String,
    context_snapshot_ref: String,
    context_sha256: String,
    metadata: String,
    created_at: String,
}

impl CheckpointRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            trigger: row.get(2)?,
            git_ref: row.get(3)?,
            state_backup_ref: row.get(4)?,
            state_sha256: row.get(5)?,
            context_snapshot_ref: row.get(6)?,
            context_sha256: row.get(7)?,
            metadata: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint> {
        let metadata: CheckpointMetadata =
            serde_json::from_str(&self.metadata).context("Failed to parse checkpoint metadata")?;
        Ok(Checkpoint {
            id: self.id,
            project_id: self.project_id,
            trigger: parse_enum::<CheckpointTrigger>(&self.trigger, "checkpoint trigger")?,
            git_ref: self.git_ref,
            state_backup_ref: self.state_backup_ref,
            state_sha256: self.state_sha256,
            context_snapshot_ref: self.context_snapshot_ref,
            context_sha256: self.context_sha256,
            metadata,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

/// Intermediate row struct for blockers.
struct BlockerRow {
    id: i64,
    project_id: i64,
    task_id: String,
    task_number: String,
    question: String,
    answer: Option<String>,
    status: String,
    created_at: String,
    resolved_at: Option<String>,
}

impl BlockerRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            task_id: row.get(2)?,
            task_number: row.get(3)?,
            question: row.get(4)?,
            answer: row.get(5)?,
            status: row.get(6)?,
            created_at: row.get(7)?,
            resolved_at: row.get(8)?,
        })
    }

    fn into_blocker(self) -> Result<Blocker> {
        Ok(Blocker {
            id: self.id,
            project_id: self.project_id,
            task_id: parse_uuid(&self.task_id)?,
            task_number: parse_number(&self.task_number)?,
            question: self.question,
            answer: self.answer,
            status: parse_enum::<BlockerStatus>(&self.status, "blocker status")?,
            created_at: parse_ts(&self.created_at)?,
            resolved_at: parse_opt_ts(self.resolved_at)?,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
