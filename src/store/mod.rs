//! Durable state: one SQLite database per project directory.

mod db;
mod models;

pub use db::{DbHandle, StateDb};
pub use models::{Blocker, BlockerStatus, STATE_BACKUP_VERSION, StateBackup};
