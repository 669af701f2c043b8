use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::workspace::Workspace;
use super::{Checkpoint, CheckpointMetadata, CheckpointTrigger, NewCheckpoint};
use crate::breakdown::WorkStatus;
use crate::context::{ContextManager, ContextSnapshot};
use crate::errors::ForemanError;
use crate::store::{DbHandle, StateBackup};

/// What a restore would change, computed without mutating anything.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestorePreview {
    pub checkpoint: Checkpoint,
    /// Workspace files that differ from the checkpoint tree.
    pub changed_files: Vec<PathBuf>,
    pub tasks_completed_now: usize,
    pub tasks_completed_at_checkpoint: usize,
    pub state_differs: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreOutcome {
    pub checkpoint_id: i64,
    pub git_ref: String,
    pub files_restored: usize,
    pub issues_restored: usize,
    pub context_items_restored: usize,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn completed_tasks(backup: &StateBackup) -> usize {
    backup
        .issues
        .iter()
        .flat_map(|i| i.tasks.iter())
        .filter(|t| t.status == WorkStatus::Completed)
        .count()
}

/// Creates and restores checkpoints for one project.
pub struct CheckpointManager {
    project_id: i64,
    db: DbHandle,
    workspace: Arc<dyn Workspace>,
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(project_id: i64, db: DbHandle, workspace: Arc<dyn Workspace>, dir: PathBuf) -> Self {
        Self {
            project_id,
            db,
            workspace,
            dir,
        }
    }

    /// Take a checkpoint of workspace, state store and context.
    ///
    /// The row is inserted only after both artifacts are written and hashed.
    /// On any failure the written artifacts are removed and nothing is
    /// registered.
    pub async fn create(
        &self,
        trigger: CheckpointTrigger,
        context: &ContextSnapshot,
        agents_active: Vec<String>,
        note: Option<String>,
    ) -> Result<Checkpoint, ForemanError> {
        let project_id = self.project_id;
        let label = Uuid::new_v4().simple().to_string();

        let backup = self
            .db
            .call(move |db| db.export_state(project_id))
            .await
            .map_err(|e| ForemanError::checkpoint("state_backup", e))?;

        let workspace = self.workspace.clone();
        let snapshot_label = label.clone();
        let git_ref = tokio::task::spawn_blocking(move || workspace.snapshot(&snapshot_label))
            .await
            .map_err(|e| ForemanError::checkpoint("workspace", e.into()))?
            .map_err(|e| ForemanError::checkpoint("workspace", e))?;

        let state_ref = format!("{label}-state.json");
        let context_ref = format!("{label}-context.json");
        let written = [self.dir.join(&state_ref), self.dir.join(&context_ref)];

        let hashes = async {
            tokio::fs::create_dir_all(&self.dir)
                .await
                .context("Failed to create checkpoint directory")?;
            let state_sha = self.write_artifact(&written[0], &backup).await?;
            let context_sha = self.write_artifact(&written[1], context).await?;
            anyhow::Ok((state_sha, context_sha))
        }
        .await;
        let (state_sha256, context_sha256) = match hashes {
            Ok(h) => h,
            Err(e) => {
                self.discard(&label, &written).await;
                return Err(ForemanError::checkpoint("artifacts", e));
            }
        };

        let last_task_completed = backup
            .issues
            .iter()
            .flat_map(|i| i.tasks.iter())
            .filter(|t| t.status == WorkStatus::Completed)
            .max_by_key(|t| t.completed_at)
            .map(|t| t.number.to_string());
        let metadata = CheckpointMetadata {
            tasks_completed: completed_tasks(&backup),
            tasks_total: backup.issues.iter().map(|i| i.tasks.len()).sum(),
            agents_active,
            context_items: context.item_count(),
            archived_items: context.archived_count(),
            last_task_completed,
            input_tokens: backup.usage.input_tokens,
            output_tokens: backup.usage.output_tokens,
            cost_usd: backup.usage.cost_usd,
            note,
        };
        let row = NewCheckpoint {
            project_id,
            trigger,
            git_ref,
            state_backup_ref: state_ref,
            state_sha256,
            context_snapshot_ref: context_ref,
            context_sha256,
            metadata,
        };
        let checkpoint = match self.db.call(move |db| db.insert_checkpoint(&row)).await {
            Ok(c) => c,
            Err(e) => {
                self.discard(&label, &written).await;
                return Err(ForemanError::checkpoint("register", e));
            }
        };

        tracing::info!(
            project_id,
            checkpoint_id = checkpoint.id,
            trigger = %trigger,
            git_ref = %checkpoint.git_ref,
            "Checkpoint created"
        );
        Ok(checkpoint)
    }

    async fn write_artifact<T: Serialize>(&self, path: &Path, value: &T) -> anyhow::Result<String> {
        let bytes = serde_json::to_vec_pretty(value).context("Failed to serialize artifact")?;
        tokio::fs::write(path, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(sha256_hex(&bytes))
    }

    /// Remove a half-built checkpoint: its workspace snapshot and artifacts.
    async fn discard(&self, label: &str, paths: &[PathBuf]) {
        let workspace = self.workspace.clone();
        let owned = label.to_string();
        match tokio::task::spawn_blocking(move || workspace.discard(&owned)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(label, error = %e, "Failed to discard workspace snapshot")
            }
            Err(e) => tracing::warn!(label, error = %e, "Workspace discard task panicked"),
        }
        for path in paths {
            if let Err(e) = tokio::fs::remove_file(path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove checkpoint artifact");
            }
        }
    }

    /// Checkpoints for this project, newest first.
    pub async fn list(&self) -> Result<Vec<Checkpoint>, ForemanError> {
        let project_id = self.project_id;
        self.db.persist(move |db| db.list_checkpoints(project_id)).await
    }

    pub async fn get(&self, id: i64) -> Result<Checkpoint, ForemanError> {
        let checkpoint = self
            .db
            .persist(move |db| db.get_checkpoint(id))
            .await?
            .ok_or_else(|| ForemanError::not_found("checkpoint", id))?;
        if checkpoint.project_id != self.project_id {
            return Err(ForemanError::not_found("checkpoint", id));
        }
        Ok(checkpoint)
    }

    /// Resolve an artifact reference, refusing anything outside the checkpoint directory.
    fn artifact_path(&self, reference: &str) -> Result<PathBuf, ForemanError> {
        let mut components = Path::new(reference).components();
        let plain = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !plain {
            return Err(ForemanError::validation(format!(
                "checkpoint artifact '{reference}' is outside the checkpoint directory"
            )));
        }
        Ok(self.dir.join(reference))
    }

    async fn read_artifact<T: DeserializeOwned>(
        &self,
        reference: &str,
        expected_sha: &str,
    ) -> Result<T, ForemanError> {
        let path = self.artifact_path(reference)?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            ForemanError::validation(format!("checkpoint artifact {} unreadable: {e}", path.display()))
        })?;
        let actual = sha256_hex(&bytes);
        if actual != expected_sha {
            return Err(ForemanError::validation(format!(
                "checkpoint artifact {reference} failed integrity check (expected {expected_sha}, got {actual})"
            )));
        }
        serde_json::from_slice(&bytes).map_err(|e| {
            ForemanError::validation(format!("checkpoint artifact {reference} is malformed: {e}"))
        })
    }

    async fn load_artifacts(
        &self,
        checkpoint: &Checkpoint,
    ) -> Result<(StateBackup, ContextSnapshot), ForemanError> {
        let backup: StateBackup = self
            .read_artifact(&checkpoint.state_backup_ref, &checkpoint.state_sha256)
            .await?;
        let snapshot: ContextSnapshot = self
            .read_artifact(&checkpoint.context_snapshot_ref, &checkpoint.context_sha256)
            .await?;
        if backup.project_id != self.project_id || snapshot.project_id != self.project_id {
            return Err(ForemanError::validation(format!(
                "checkpoint {} artifacts belong to another project",
                checkpoint.id
            )));
        }
        Ok((backup, snapshot))
    }

    /// The verified context snapshot stored with a checkpoint.
    pub async fn load_context_snapshot(&self, id: i64) -> Result<ContextSnapshot, ForemanError> {
        let checkpoint = self.get(id).await?;
        let (_, snapshot) = self.load_artifacts(&checkpoint).await?;
        Ok(snapshot)
    }

    pub async fn preview_restore(&self, id: i64) -> Result<RestorePreview, ForemanError> {
        let checkpoint = self.get(id).await?;
        let (backup, _) = self.load_artifacts(&checkpoint).await?;
        let project_id = self.project_id;
        let current = self
            .db
            .persist(move |db| db.export_state(project_id))
            .await?;

        let workspace = self.workspace.clone();
        let git_ref = checkpoint.git_ref.clone();
        let changed_files = tokio::task::spawn_blocking(move || workspace.changed_files(&git_ref))
            .await
            .map_err(|e| ForemanError::persistence(e.into()))?
            .map_err(ForemanError::persistence)?;

        Ok(RestorePreview {
            changed_files,
            tasks_completed_now: completed_tasks(&current),
            tasks_completed_at_checkpoint: completed_tasks(&backup),
            state_differs: !current.same_state(&backup),
            checkpoint,
        })
    }

    /// Reinstate workspace, state store and context from a checkpoint.
    ///
    /// Every artifact is verified before anything is touched. The workspace
    /// is restored inside the state transaction, and a safety snapshot of the
    /// current tree is taken first so a failed commit can put it back. On
    /// error the pre-restore state is left as it was.
    pub async fn restore(
        &self,
        id: i64,
        context: &ContextManager,
    ) -> Result<RestoreOutcome, ForemanError> {
        let checkpoint = self.get(id).await?;
        let (backup, snapshot) = self.load_artifacts(&checkpoint).await?;
        if !self.workspace.contains(&checkpoint.git_ref) {
            return Err(ForemanError::validation(format!(
                "workspace reference {} of checkpoint {} no longer exists",
                checkpoint.git_ref, id
            )));
        }

        let workspace = self.workspace.clone();
        let target = checkpoint.git_ref.clone();
        let safety_label = format!("pre-restore-{}", Uuid::new_v4().simple());
        let (safety_ref, changed) = tokio::task::spawn_blocking(move || {
            let changed = workspace.changed_files(&target)?;
            let safety = workspace.snapshot(&safety_label)?;
            anyhow::Ok((safety, changed))
        })
        .await
        .map_err(|e| ForemanError::persistence(e.into()))?
        .map_err(ForemanError::persistence)?;

        let workspace = self.workspace.clone();
        let target = checkpoint.git_ref.clone();
        let issues_restored = backup.issues.len();
        let result = self
            .db
            .call(move |db| db.restore_state_with(&backup, || workspace.restore(&target)))
            .await;

        if let Err(e) = result {
            let workspace = self.workspace.clone();
            let rollback =
                tokio::task::spawn_blocking(move || workspace.restore(&safety_ref)).await;
            match rollback {
                Ok(Ok(())) => {}
                Ok(Err(re)) => {
                    tracing::error!(checkpoint_id = id, error = %re, "Failed to roll back workspace after restore failure")
                }
                Err(re) => {
                    tracing::error!(checkpoint_id = id, error = %re, "Workspace rollback task panicked")
                }
            }
            return Err(ForemanError::persistence(e.context(format!(
                "Failed to restore checkpoint {}",
                id
            ))));
        }

        context.restore_snapshot(&snapshot)?;

        tracing::info!(
            project_id = self.project_id,
            checkpoint_id = id,
            files = changed.len(),
            "Checkpoint restored"
        );
        Ok(RestoreOutcome {
            checkpoint_id: id,
            git_ref: checkpoint.git_ref,
            files_restored: changed.len(),
            issues_restored,
            context_items_restored: snapshot.item_count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakdown::{FeatureSpec, TaskSpec, WorkBreakdown, WorkNumber};
    use crate::checkpoint::GitWorkspace;
    use crate::config::FOREMAN_DIR;
    use crate::context::{FlashSaveConfig, ItemKind, TierPolicy};
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        db: DbHandle,
        context: ContextManager,
        project_id: i64,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        git2::Repository::init(&root).unwrap();
        let foreman = root.join(FOREMAN_DIR);
        fs::create_dir_all(&foreman).unwrap();
        fs::write(foreman.join(".gitignore"), "*\n").unwrap();
        fs::write(root.join("lib.rs"), "pub fn v1() {}").unwrap();

        let db = DbHandle::in_memory().unwrap();
        let project_id = {
            let guard = db.lock_sync().unwrap();
            let project = guard.create_project("shop", root.to_str().unwrap(), 1).unwrap();
            let wb = WorkBreakdown::from_features(
                1,
                vec![FeatureSpec {
                    title: "Auth".into(),
                    tasks: vec![TaskSpec::new("schema", ""), TaskSpec::new("endpoint", "")],
                    ..Default::default()
                }],
            )
            .unwrap();
            guard.save_breakdown(project.id, &wb).unwrap();
            project.id
        };
        let context = ContextManager::new(
            project_id,
            db.clone(),
            TierPolicy::default(),
            FlashSaveConfig::default(),
        );
        context.add_item("backend-worker-001", ItemKind::Note, "remember the schema");
        Fixture {
            _dir: dir,
            root,
            db,
            context,
            project_id,
        }
    }

    fn manager(f: &Fixture, workspace: Arc<dyn Workspace>) -> CheckpointManager {
        CheckpointManager::new(
            f.project_id,
            f.db.clone(),
            workspace,
            f.root.join(FOREMAN_DIR).join("checkpoints"),
        )
    }

    fn git(f: &Fixture) -> Arc<dyn Workspace> {
        Arc::new(GitWorkspace::open(&f.root).unwrap())
    }

    fn export(f: &Fixture) -> StateBackup {
        f.db.lock_sync().unwrap().export_state(f.project_id).unwrap()
    }

    fn mutate(f: &Fixture) {
        let guard = f.db.lock_sync().unwrap();
        let mut wb = guard.load_breakdown(f.project_id).unwrap();
        let number: WorkNumber = "1.1.1".parse().unwrap();
        wb.task_mut(&number).unwrap().status = WorkStatus::Completed;
        guard.save_breakdown(f.project_id, &wb).unwrap();
    }

    /// Delegates to git but can be told to fail a restore.
    struct FlakyWorkspace {
        inner: GitWorkspace,
        fail_snapshot: bool,
        fail_restore: AtomicBool,
    }

    impl Workspace for FlakyWorkspace {
        fn snapshot(&self, label: &str) -> anyhow::Result<String> {
            if self.fail_snapshot {
                anyhow::bail!("repository locked");
            }
            self.inner.snapshot(label)
        }
        fn contains(&self, reference: &str) -> bool {
            self.inner.contains(reference)
        }
        fn changed_files(&self, reference: &str) -> anyhow::Result<Vec<PathBuf>> {
            self.inner.changed_files(reference)
        }
        fn restore(&self, reference: &str) -> anyhow::Result<()> {
            if self.fail_restore.load(Ordering::SeqCst) {
                anyhow::bail!("checkout conflict");
            }
            self.inner.restore(reference)
        }
        fn discard(&self, label: &str) -> anyhow::Result<()> {
            self.inner.discard(label)
        }
    }

    #[tokio::test]
    async fn test_create_writes_hashed_artifacts_then_row() {
        let f = fixture();
        let mgr = manager(&f, git(&f));
        let cp = mgr
            .create(
                CheckpointTrigger::Manual,
                &f.context.snapshot(),
                vec!["backend-worker-001".into()],
                Some("before refactor".into()),
            )
            .await
            .unwrap();

        let state_bytes = fs::read(mgr.dir.join(&cp.state_backup_ref)).unwrap();
        assert_eq!(sha256_hex(&state_bytes), cp.state_sha256);
        assert_eq!(cp.metadata.tasks_total, 2);
        assert_eq!(cp.metadata.context_items, 1);
        assert_eq!(cp.metadata.agents_active, vec!["backend-worker-001"]);
        assert_eq!(mgr.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_workspace_snapshot_registers_nothing() {
        let f = fixture();
        let flaky = Arc::new(FlakyWorkspace {
            inner: GitWorkspace::open(&f.root).unwrap(),
            fail_snapshot: true,
            fail_restore: AtomicBool::new(false),
        });
        let mgr = manager(&f, flaky);
        let err = mgr
            .create(CheckpointTrigger::Pause, &f.context.snapshot(), vec![], None)
            .await
            .unwrap_err();
        assert!(matches!(err, ForemanError::CheckpointIncomplete { step: "workspace", .. }));
        assert!(mgr.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_registration_removes_artifacts() {
        let f = fixture();
        f.db.lock_sync()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER fail_checkpoint BEFORE INSERT ON checkpoints
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();
        let mgr = manager(&f, git(&f));
        let err = mgr
            .create(CheckpointTrigger::Scheduled, &f.context.snapshot(), vec![], None)
            .await
            .unwrap_err();
        assert!(matches!(err, ForemanError::CheckpointIncomplete { step: "register", .. }));
        let leftovers = fs::read_dir(&mgr.dir).unwrap().count();
        assert_eq!(leftovers, 0);
        // The workspace snapshot ref goes with the artifacts.
        let repo = git2::Repository::open(&f.root).unwrap();
        let refs = repo
            .references_glob("refs/foreman/checkpoints/*")
            .unwrap()
            .count();
        assert_eq!(refs, 0);
    }

    #[tokio::test]
    async fn test_restore_round_trip_reproduces_state_workspace_and_context() {
        let f = fixture();
        let mgr = manager(&f, git(&f));
        let state_before = export(&f);
        let context_before = f.context.snapshot();
        let cp = mgr
            .create(CheckpointTrigger::Manual, &context_before, vec![], None)
            .await
            .unwrap();

        mutate(&f);
        fs::write(f.root.join("lib.rs"), "pub fn v2() {}").unwrap();
        f.context.add_item("frontend-worker-001", ItemKind::Note, "later");

        let preview = mgr.preview_restore(cp.id).await.unwrap();
        assert_eq!(preview.changed_files, vec![PathBuf::from("lib.rs")]);
        assert!(preview.state_differs);
        assert_eq!(preview.tasks_completed_now, 1);
        assert_eq!(preview.tasks_completed_at_checkpoint, 0);
        // Preview mutates nothing.
        assert_eq!(fs::read_to_string(f.root.join("lib.rs")).unwrap(), "pub fn v2() {}");

        let outcome = mgr.restore(cp.id, &f.context).await.unwrap();
        assert_eq!(outcome.files_restored, 1);
        assert!(export(&f).same_state(&state_before));
        assert_eq!(fs::read_to_string(f.root.join("lib.rs")).unwrap(), "pub fn v1() {}");
        assert_eq!(f.context.snapshot(), context_before);
    }

    #[tokio::test]
    async fn test_tampered_artifact_fails_closed() {
        let f = fixture();
        let mgr = manager(&f, git(&f));
        let cp = mgr
            .create(CheckpointTrigger::Manual, &f.context.snapshot(), vec![], None)
            .await
            .unwrap();
        mutate(&f);
        let before = export(&f);
        fs::write(mgr.dir.join(&cp.state_backup_ref), "{}").unwrap();

        let err = mgr.restore(cp.id, &f.context).await.unwrap_err();
        assert!(err.to_string().contains("integrity"));
        assert!(export(&f).same_state(&before));
    }

    #[tokio::test]
    async fn test_workspace_restore_failure_leaves_state_untouched() {
        let f = fixture();
        let flaky = Arc::new(FlakyWorkspace {
            inner: GitWorkspace::open(&f.root).unwrap(),
            fail_snapshot: false,
            fail_restore: AtomicBool::new(false),
        });
        let mgr = manager(&f, flaky.clone());
        let cp = mgr
            .create(CheckpointTrigger::Manual, &f.context.snapshot(), vec![], None)
            .await
            .unwrap();

        mutate(&f);
        fs::write(f.root.join("lib.rs"), "pub fn v2() {}").unwrap();
        f.context.add_item("frontend-worker-001", ItemKind::Note, "later");
        let state = export(&f);
        let context = f.context.snapshot();

        flaky.fail_restore.store(true, Ordering::SeqCst);
        assert!(mgr.restore(cp.id, &f.context).await.is_err());
        assert!(export(&f).same_state(&state));
        assert_eq!(f.context.snapshot(), context);
        assert_eq!(fs::read_to_string(f.root.join("lib.rs")).unwrap(), "pub fn v2() {}");
    }

    #[test]
    fn test_artifact_path_rejects_escape() {
        let f = fixture();
        let mgr = manager(&f, git(&f));
        assert!(mgr.artifact_path("../state.db").is_err());
        assert!(mgr.artifact_path("/etc/passwd").is_err());
        assert!(mgr.artifact_path("a/b.json").is_err());
        assert!(mgr.artifact_path("abc-state.json").is_ok());
    }
}
