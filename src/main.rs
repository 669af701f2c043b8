use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod cmd;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version, about = "Evidence-gated multi-agent delivery orchestrator")]
pub struct Cli {
    /// Project root (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "FOREMAN_LOG_JSON")]
    pub log_json: bool,

    /// Override the configured worker limit
    #[arg(long, global = true)]
    pub max_workers: Option<usize>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a foreman project in the project directory
    Init {
        /// Project name (defaults to the directory name)
        #[arg(long)]
        name: Option<String>,
        /// Numbering scope for issues (the leading segment of every number)
        #[arg(long, default_value = "1")]
        scope: u32,
    },
    /// Load a work breakdown from a JSON feature list and activate the project
    Plan {
        /// JSON file holding an array of features with their tasks
        features: PathBuf,
    },
    /// Show lifecycle status, task progress and open blockers
    Status,
    /// Pause the project, flash-saving context and taking a checkpoint
    Pause {
        #[arg(long, default_value = "operator request")]
        reason: String,
    },
    /// Resume a paused project
    Resume,
    /// Stop a paused project
    Stop,
    /// Manage checkpoints
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
    /// Show the evidence trail for a task
    Evidence {
        /// Task number, e.g. 1.2.3
        task: String,
    },
    /// List or answer human blockers
    Blocker {
        #[command(subcommand)]
        command: BlockerCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum CheckpointCommands {
    /// Take a manual checkpoint
    Create {
        #[arg(long)]
        note: Option<String>,
    },
    /// List checkpoints, newest first
    List,
    /// Show what restoring a checkpoint would change
    Preview { id: i64 },
    /// Restore a checkpoint (project must be paused)
    Restore { id: i64 },
}

#[derive(Subcommand, Clone)]
pub enum BlockerCommands {
    /// List blockers
    List {
        /// Include answered blockers
        #[arg(long)]
        all: bool,
    },
    /// Answer a blocker so its task can be retried
    Resolve { id: i64, answer: String },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Logs go to stderr so command output on stdout stays clean.
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init { name, scope } => cmd::cmd_init(&project_dir, name.as_deref(), *scope)?,
        Commands::Plan { features } => cmd::cmd_plan(&project_dir, &cli, features).await?,
        Commands::Status => cmd::cmd_status(&project_dir, &cli).await?,
        Commands::Pause { reason } => cmd::cmd_pause(&project_dir, &cli, reason).await?,
        Commands::Resume => cmd::cmd_resume(&project_dir, &cli).await?,
        Commands::Stop => cmd::cmd_stop(&project_dir, &cli).await?,
        Commands::Checkpoint { command } => {
            cmd::cmd_checkpoint(&project_dir, &cli, command.clone()).await?
        }
        Commands::Evidence { task } => cmd::cmd_evidence(&project_dir, &cli, task).await?,
        Commands::Blocker { command } => {
            cmd::cmd_blocker(&project_dir, &cli, command.clone()).await?
        }
    }

    Ok(())
}
