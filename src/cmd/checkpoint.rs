//! Checkpoint commands: `foreman checkpoint create|list|preview|restore`.

use std::path::Path;

use anyhow::Result;

use foreman::checkpoint::CheckpointTrigger;

use super::ProjectHandle;
use crate::{CheckpointCommands, Cli};

pub async fn cmd_checkpoint(project_dir: &Path, cli: &Cli, command: CheckpointCommands) -> Result<()> {
    let handle = ProjectHandle::open(project_dir, cli)?;

    match command {
        CheckpointCommands::Create { note } => {
            let checkpoint = handle
                .lifecycle
                .checkpoint(CheckpointTrigger::Manual, note)
                .await?;
            println!(
                "Created checkpoint #{} ({}/{} tasks completed, workspace {})",
                checkpoint.id,
                checkpoint.metadata.tasks_completed,
                checkpoint.metadata.tasks_total,
                short_ref(&checkpoint.git_ref)
            );
        }
        CheckpointCommands::List => {
            let checkpoints = handle.checkpoints.list().await?;
            if checkpoints.is_empty() {
                println!("No checkpoints.");
                return Ok(());
            }
            for cp in checkpoints {
                let note = cp.metadata.note.as_deref().unwrap_or("");
                println!(
                    "#{:<4} {:<15} {}  tasks {}/{}  {}  {}",
                    cp.id,
                    cp.trigger.as_str(),
                    cp.created_at.format("%Y-%m-%d %H:%M:%S"),
                    cp.metadata.tasks_completed,
                    cp.metadata.tasks_total,
                    short_ref(&cp.git_ref),
                    note
                );
            }
        }
        CheckpointCommands::Preview { id } => {
            let preview = handle.checkpoints.preview_restore(id).await?;
            println!(
                "Checkpoint #{} ({}, {})",
                preview.checkpoint.id,
                preview.checkpoint.trigger,
                preview.checkpoint.created_at.to_rfc3339()
            );
            println!(
                "Tasks completed: {} now, {} at checkpoint",
                preview.tasks_completed_now, preview.tasks_completed_at_checkpoint
            );
            if preview.state_differs {
                println!("Durable state differs from the checkpoint.");
            }
            if preview.changed_files.is_empty() {
                println!("Workspace matches the checkpoint.");
            } else {
                println!("Files that would change:");
                for file in &preview.changed_files {
                    println!("  {}", file.display());
                }
            }
        }
        CheckpointCommands::Restore { id } => {
            let outcome = handle.lifecycle.restore(id).await?;
            println!(
                "Restored checkpoint #{}: {} files, {} issues, {} context items. Project stays paused.",
                outcome.checkpoint_id,
                outcome.files_restored,
                outcome.issues_restored,
                outcome.context_items_restored
            );
        }
    }
    Ok(())
}

fn short_ref(git_ref: &str) -> &str {
    git_ref.get(..8).unwrap_or(git_ref)
}
