//! Project setup, lifecycle, evidence and blocker commands.

use std::path::Path;

use anyhow::{Context, Result};

use foreman::breakdown::{FeatureSpec, WorkBreakdown, WorkNumber, WorkStatus};
use foreman::checkpoint::GitWorkspace;
use foreman::config::{CONFIG_FILE, FOREMAN_DIR, ForemanToml};
use foreman::store::StateDb;

use super::ProjectHandle;
use crate::{BlockerCommands, Cli};

pub fn cmd_init(project_dir: &Path, name: Option<&str>, scope: u32) -> Result<()> {
    std::fs::create_dir_all(project_dir)
        .with_context(|| format!("Failed to create {}", project_dir.display()))?;
    let root = project_dir
        .canonicalize()
        .context("Failed to resolve project directory")?;
    let foreman_dir = root.join(FOREMAN_DIR);

    // Also creates `.foreman/` and its ignore file.
    GitWorkspace::init_or_open(&root)?;
    std::fs::create_dir_all(foreman_dir.join("checkpoints"))
        .context("Failed to create checkpoint directory")?;

    let name = name.map(str::to_string).unwrap_or_else(|| {
        root.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string())
    });

    let config_path = foreman_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        let mut toml = ForemanToml::default();
        toml.project.name = Some(name.clone());
        toml.save(&config_path)?;
    }

    let db = StateDb::new(&foreman_dir.join("state.db"))?;
    if let Some(existing) = db.list_projects()?.into_iter().next() {
        println!(
            "Foreman project '{}' already initialized at {}",
            existing.name,
            foreman_dir.display()
        );
        return Ok(());
    }
    let project = db.create_project(&name, &root.display().to_string(), scope)?;
    tracing::info!(project_id = project.id, name = %project.name, "Project initialized");

    println!("Initialized foreman project '{}' at {}", project.name, foreman_dir.display());
    println!();
    println!("Next steps:");
    println!("  1. Write a feature list (JSON array of {{title, description, tasks}})");
    println!("  2. Run `foreman plan <features.json>` to build the work breakdown");
    Ok(())
}

pub async fn cmd_plan(project_dir: &Path, cli: &Cli, features: &Path) -> Result<()> {
    let handle = ProjectHandle::open(project_dir, cli)?;
    let content = std::fs::read_to_string(features)
        .with_context(|| format!("Failed to read {}", features.display()))?;
    let specs: Vec<FeatureSpec> =
        serde_json::from_str(&content).context("Feature list must be a JSON array of features")?;

    // Build and validate before touching the lifecycle.
    let breakdown = WorkBreakdown::from_features(handle.project.scope, specs)?;
    breakdown.validate()?;
    handle.lifecycle.plan(&breakdown).await?;

    let (_, total) = breakdown.task_counts();
    let issues = breakdown.issues().len();

    println!("Planned {} issues with {} tasks. Project is active.", issues, total);
    Ok(())
}

pub async fn cmd_status(project_dir: &Path, cli: &Cli) -> Result<()> {
    let handle = ProjectHandle::open(project_dir, cli)?;
    let project = handle.lifecycle.project().await?;
    let project_id = project.id;
    let (breakdown, blockers) = handle
        .db
        .call(move |db| Ok((db.load_breakdown(project_id)?, db.list_blockers(project_id, true)?)))
        .await?;

    println!("Project: {} (#{})", project.name, project.id);
    println!("Status: {}", project.status);
    println!("Config: {}", handle.config.config_file().display());
    if let Some(meta) = &project.pause_metadata {
        println!(
            "Paused: {} (checkpoint #{}, {})",
            meta.reason,
            meta.checkpoint_id,
            meta.paused_at.to_rfc3339()
        );
    }
    let (done, total) = breakdown.task_counts();
    println!("Tasks: {}/{} completed", done, total);
    for issue in breakdown.issues() {
        let marker = match issue.status {
            WorkStatus::Completed => "✓",
            WorkStatus::InProgress => "▶",
            WorkStatus::Failed => "✗",
            WorkStatus::Blocked => "!",
            WorkStatus::Pending => " ",
        };
        println!("  [{}] {} {} ({})", marker, issue.number, issue.title, issue.status);
    }
    println!(
        "Usage: {} input / {} output tokens, ${:.2}",
        project.usage.input_tokens, project.usage.output_tokens, project.usage.cost_usd
    );
    if !blockers.is_empty() {
        println!("Open blockers: {}", blockers.len());
    }
    Ok(())
}

pub async fn cmd_pause(project_dir: &Path, cli: &Cli, reason: &str) -> Result<()> {
    let handle = ProjectHandle::open(project_dir, cli)?;
    let result = handle.lifecycle.pause(reason).await?;
    println!(
        "Paused (was {}). Checkpoint #{} taken.",
        result.previous_status, result.checkpoint_id
    );
    if !result.flash_saves.is_empty() {
        println!(
            "Flash-saved {} agents: {} -> {} tokens ({:.1}% reduction)",
            result.flash_saves.len(),
            result.tokens_before,
            result.tokens_after,
            result.reduction_percentage
        );
    }
    Ok(())
}

pub async fn cmd_resume(project_dir: &Path, cli: &Cli) -> Result<()> {
    let handle = ProjectHandle::open(project_dir, cli)?;
    // A fresh process has no live context, so always reload from the pause
    // checkpoint.
    let result = handle.lifecycle.resume(true).await?;
    match result.restored_from {
        Some(id) => println!(
            "Resumed. Reloaded {} context items from checkpoint #{}.",
            result.context_items, id
        ),
        None => println!("Resumed."),
    }
    Ok(())
}

pub async fn cmd_stop(project_dir: &Path, cli: &Cli) -> Result<()> {
    let handle = ProjectHandle::open(project_dir, cli)?;
    handle.lifecycle.stop().await?;
    println!("Stopped.");
    Ok(())
}

pub async fn cmd_evidence(project_dir: &Path, cli: &Cli, task: &str) -> Result<()> {
    let handle = ProjectHandle::open(project_dir, cli)?;
    let number = WorkNumber::parse_task(task)?;
    let project_id = handle.project.id;
    let lookup = number.clone();
    let records = handle
        .db
        .call(move |db| db.list_evidence_by_number(project_id, &lookup))
        .await?;

    if records.is_empty() {
        println!("No evidence recorded for task {}", number);
        return Ok(());
    }
    for record in records {
        println!("{}", record.render());
    }
    Ok(())
}

pub async fn cmd_blocker(project_dir: &Path, cli: &Cli, command: BlockerCommands) -> Result<()> {
    let handle = ProjectHandle::open(project_dir, cli)?;
    let project_id = handle.project.id;
    match command {
        BlockerCommands::List { all } => {
            let blockers = handle
                .db
                .call(move |db| db.list_blockers(project_id, !all))
                .await?;
            if blockers.is_empty() {
                println!("No blockers.");
            }
            for b in blockers {
                println!("#{} [{}] task {}: {}", b.id, b.status.as_str(), b.task_number, b.question);
                if let Some(answer) = &b.answer {
                    println!("    answer: {}", answer);
                }
            }
        }
        BlockerCommands::Resolve { id, answer } => {
            let blocker = handle
                .db
                .call(move |db| db.resolve_blocker(id, &answer))
                .await?;
            tracing::info!(blocker_id = blocker.id, task = %blocker.task_number, "Blocker resolved");
            println!("Resolved blocker #{} for task {}.", blocker.id, blocker.task_number);
        }
    }
    Ok(())
}
