//! Allowed status edges for tasks and issues.

use crate::breakdown::WorkStatus;
use crate::errors::ForemanError;

/// Task edges. `InProgress -> InProgress` covers a retry or a run resumed
/// after a pause. `Failed` and `Completed` are terminal.
pub fn check_task(from: WorkStatus, to: WorkStatus) -> Result<(), ForemanError> {
    use WorkStatus::*;
    let allowed = matches!(
        (from, to),
        (Pending, InProgress)
            | (Blocked, InProgress)
            | (InProgress, InProgress)
            | (InProgress, Completed)
            | (InProgress, Failed)
            | (InProgress, Blocked)
    );
    edge("task", from, to, allowed)
}

/// Issue edges: `pending -> in_progress -> {completed | failed}`.
pub fn check_issue(from: WorkStatus, to: WorkStatus) -> Result<(), ForemanError> {
    use WorkStatus::*;
    let allowed = matches!(
        (from, to),
        (Pending, InProgress) | (InProgress, Completed) | (InProgress, Failed)
    );
    edge("issue", from, to, allowed)
}

fn edge(
    entity: &'static str,
    from: WorkStatus,
    to: WorkStatus,
    allowed: bool,
) -> Result<(), ForemanError> {
    if allowed {
        Ok(())
    } else {
        Err(ForemanError::InvalidTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
