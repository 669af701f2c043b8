//! Project lifecycle: `init -> planning -> active <-> paused -> stopped`,
//! with `completed` reachable from any non-terminal state once every issue
//! is done.
//!
//! Status lives in the store and is only changed through compare-and-set
//! writes, so a transition either lands completely or leaves the recorded
//! status where it was.

mod machine;
mod status;

pub use machine::{PauseResult, ProjectLifecycle, ResumeResult};
pub use status::{PauseMetadata, Project, ProjectStatus};
