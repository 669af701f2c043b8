//! CLI command implementations.
//!
//! | Module       | Commands handled                                                  |
//! |--------------|-------------------------------------------------------------------|
//! | `project`    | `Init`, `Plan`, `Status`, `Pause`, `Resume`, `Stop`, `Evidence`, `Blocker` |
//! | `checkpoint` | `Checkpoint`                                                      |

pub mod checkpoint;
pub mod project;

pub use checkpoint::cmd_checkpoint;
pub use project::{
    cmd_blocker, cmd_evidence, cmd_init, cmd_pause, cmd_plan, cmd_resume, cmd_status, cmd_stop,
};

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use foreman::agents::PauseHandle;
use foreman::checkpoint::{CheckpointManager, GitWorkspace};
use foreman::config::{FOREMAN_DIR, ForemanConfig};
use foreman::context::ContextManager;
use foreman::events::{EventBus, LogNotifier};
use foreman::lifecycle::{Project, ProjectLifecycle, ProjectStatus};
use foreman::store::DbHandle;

use crate::Cli;

/// Everything a command needs to act on the project in `project_dir`.
pub struct ProjectHandle {
    pub config: ForemanConfig,
    pub db: DbHandle,
    pub project: Project,
    pub checkpoints: Arc<CheckpointManager>,
    pub lifecycle: ProjectLifecycle,
}

impl ProjectHandle {
    pub fn open(project_dir: &Path, cli: &Cli) -> Result<Self> {
        if !project_dir.join(FOREMAN_DIR).is_dir() {
            anyhow::bail!(
                "No foreman project at {}. Run `foreman init` first.",
                project_dir.display()
            );
        }
        let config = ForemanConfig::with_cli_args(project_dir.to_path_buf(), cli.max_workers)?;
        for warning in config.validate() {
            tracing::warn!(%warning, "Configuration warning");
        }

        let db = DbHandle::open(&config.db_path())?;
        let project = db
            .lock_sync()?
            .list_projects()?
            .into_iter()
            .next()
            .context("State database has no project. Run `foreman init` first.")?;

        let workspace = GitWorkspace::open(&config.project_dir)?;
        let context = Arc::new(ContextManager::new(
            project.id,
            db.clone(),
            config.tier_policy(),
            config.flash_save(),
        ));
        let checkpoints = Arc::new(CheckpointManager::new(
            project.id,
            db.clone(),
            Arc::new(workspace),
            config.checkpoint_dir(),
        ));
        // Workers in this process only run while the stored status is active.
        let pause = PauseHandle::new();
        if project.status != ProjectStatus::Active {
            pause.pause();
        }
        let lifecycle = ProjectLifecycle::new(
            project.id,
            db.clone(),
            context,
            checkpoints.clone(),
            EventBus::new().with_notifier(Arc::new(LogNotifier)),
            pause,
        );

        Ok(Self {
            config,
            db,
            project,
            checkpoints,
            lifecycle,
        })
    }
}
