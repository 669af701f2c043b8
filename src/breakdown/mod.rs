//! Work-breakdown model: hierarchical issues and sequential task chains.
//!
//! Issues at the same depth may run concurrently; the tasks of one issue
//! never do. Numbers are typed paths ([`WorkNumber`]), so ordering and
//! prefix checks never go through string parsing at the use site.

mod model;
mod number;
mod plan;

pub use model::{Issue, Priority, Task, WorkStatus};
pub use number::{ISSUE_DEPTH, TASK_DEPTH, WorkNumber};
pub use plan::{FeatureSpec, TaskSpec, WorkBreakdown};
