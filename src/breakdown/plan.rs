//! The issue/task forest and its mutation rules.
//!
//! A `WorkBreakdown` owns every issue of one scope. Issues are numbered
//! `{scope}.{index}` and own a sequential task chain numbered
//! `{issue}.{index}`; each task after the first depends on its predecessor.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::model::{Issue, Priority, Task, WorkStatus};
use super::number::{ISSUE_DEPTH, TASK_DEPTH, WorkNumber};
use crate::errors::ForemanError;

/// One decomposed feature: becomes an issue with a task chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Explicit priority; derived from the text when absent.
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    pub title: String,
    #[serde(default)]
    pub description: String,
}

impl TaskSpec {
    pub fn new(title: &str, description: &str) -> Self {
        Self {
            title: title.to_string(),
            description: description.to_string(),
        }
    }
}

/// Ordered forest of issues for one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkBreakdown {
    scope: u32,
    issues: Vec<Issue>,
}

impl WorkBreakdown {
    pub fn new(scope: u32) -> Self {
        Self {
            scope: scope.max(1),
            issues: Vec::new(),
        }
    }

    /// Build issues and their sequential task chains from decomposed features.
    pub fn from_features(scope: u32, features: Vec<FeatureSpec>) -> Result<Self, ForemanError> {
        let mut breakdown = Self::new(scope);
        for feature in features {
            breakdown.add_issue(feature)?;
        }
        Ok(breakdown)
    }

    /// Adopt previously persisted issues after validating them.
    pub fn from_issues(scope: u32, mut issues: Vec<Issue>) -> Result<Self, ForemanError> {
        issues.sort_by(|a, b| a.number.cmp(&b.number));
        for issue in &mut issues {
            issue.tasks.sort_by(|a, b| a.number.cmp(&b.number));
        }
        let breakdown = Self {
            scope: scope.max(1),
            issues,
        };
        breakdown.validate()?;
        Ok(breakdown)
    }

    pub fn scope(&self) -> u32 {
        self.scope
    }

    pub fn issues(&self) -> &[Issue] {
        &self.issues
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// Append a new issue with its task chain.
    pub fn add_issue(&mut self, feature: FeatureSpec) -> Result<&Issue, ForemanError> {
        if feature.title.trim().is_empty() {
            return Err(ForemanError::validation("issue title must not be empty"));
        }
        let index = self.issues.len() as u32 + 1;
        let number = WorkNumber::issue(self.scope, index)?;
        let priority = feature.priority.unwrap_or_else(|| {
            Priority::from_text(&format!("{} {}", feature.title, feature.description))
        });
        let mut issue = Issue::new(number, &feature.title, &feature.description, priority);
        issue.tasks = build_chain(&issue.number, &feature.tasks)?;
        self.issues.push(issue);
        Ok(&self.issues[self.issues.len() - 1])
    }

    pub fn issue(&self, number: &WorkNumber) -> Option<&Issue> {
        self.issues.iter().find(|i| &i.number == number)
    }

    pub(crate) fn issue_mut(&mut self, number: &WorkNumber) -> Option<&mut Issue> {
        self.issues.iter_mut().find(|i| &i.number == number)
    }

    pub fn task(&self, number: &WorkNumber) -> Option<&Task> {
        let parent = number.parent()?;
        self.issue(&parent)?.task(number)
    }

    pub(crate) fn task_mut(&mut self, number: &WorkNumber) -> Option<&mut Task> {
        let parent = number.parent()?;
        self.issue_mut(&parent)?
            .tasks
            .iter_mut()
            .find(|t| &t.number == number)
    }

    fn require_task(&self, number: &WorkNumber) -> Result<&Task, ForemanError> {
        number.expect_depth(TASK_DEPTH, "task")?;
        self.task(number)
            .ok_or_else(|| ForemanError::not_found("task", number))
    }

    /// Insert a task at 1-based `position` within `issue`.
    ///
    /// Later siblings shift up by one and every dependency reference to a
    /// shifted task is rewritten. The new task depends on its predecessor,
    /// and the task that now follows it depends on the new task. Insertion
    /// ahead of a task that has already started is rejected.
    pub fn insert_task(
        &mut self,
        issue: &WorkNumber,
        position: u32,
        spec: TaskSpec,
    ) -> Result<WorkNumber, ForemanError> {
        issue.expect_depth(ISSUE_DEPTH, "issue")?;
        if spec.title.trim().is_empty() {
            return Err(ForemanError::validation("task title must not be empty"));
        }
        let target = self
            .issue(issue)
            .ok_or_else(|| ForemanError::not_found("issue", issue))?;
        if target.status.is_terminal() {
            return Err(ForemanError::validation(format!(
                "issue {issue} is {} and cannot take new tasks",
                target.status
            )));
        }
        let len = target.tasks.len() as u32;
        if position == 0 || position > len + 1 {
            return Err(ForemanError::validation(format!(
                "position {position} is outside 1-{} for issue {issue}",
                len + 1
            )));
        }
        if let Some(started) = target
            .tasks
            .iter()
            .skip(position as usize - 1)
            .find(|t| t.status != WorkStatus::Pending)
        {
            return Err(ForemanError::validation(format!(
                "cannot insert ahead of task {} which is already {}",
                started.number, started.status
            )));
        }

        let renumbered: HashMap<WorkNumber, WorkNumber> = target
            .tasks
            .iter()
            .filter(|t| t.number.index() >= position)
            .map(|t| (t.number.clone(), t.number.with_index(t.number.index() + 1)))
            .collect();

        // Rewrite dependency references everywhere, then the numbers themselves.
        for other in self.issues.iter_mut().flat_map(|i| i.tasks.iter_mut()) {
            for dep in &mut other.depends_on {
                if let Some(new) = renumbered.get(dep) {
                    *dep = new.clone();
                }
            }
            if let Some(new) = renumbered.get(&other.number) {
                other.number = new.clone();
            }
        }

        let new_number = issue.child(position);
        let predecessor = (position > 1).then(|| issue.child(position - 1));
        let mut task = Task::new(issue, position, &spec.title, &spec.description);
        task.depends_on.extend(predecessor.clone());

        let target = self
            .issue_mut(issue)
            .ok_or_else(|| ForemanError::not_found("issue", issue))?;
        let follower_number = issue.child(position + 1);
        if let Some(follower) = target.tasks.iter_mut().find(|t| t.number == follower_number) {
            if let Some(pred) = &predecessor {
                follower.depends_on.retain(|d| d != pred);
            }
            if !follower.depends_on.contains(&new_number) {
                follower.depends_on.push(new_number.clone());
            }
            follower.depends_on.sort();
        }
        target.tasks.insert(position as usize - 1, task);

        tracing::debug!(issue = %issue, task = %new_number, shifted = renumbered.len(), "Inserted task");
        Ok(new_number)
    }

    /// Immediate predecessor of a task within its issue, if any.
    pub fn predecessor(&self, task: &WorkNumber) -> Result<Option<&Task>, ForemanError> {
        self.require_task(task)?;
        if task.index() == 1 {
            return Ok(None);
        }
        Ok(self.task(&task.with_index(task.index() - 1)))
    }

    pub fn parent_issue(&self, task: &WorkNumber) -> Result<&Issue, ForemanError> {
        self.require_task(task)?;
        let parent = task
            .parent()
            .ok_or_else(|| ForemanError::validation(format!("task {task} has no parent")))?;
        self.issue(&parent)
            .ok_or_else(|| ForemanError::not_found("issue", parent))
    }

    /// Dependencies of `task` that are not yet completed.
    pub fn unmet_dependencies(&self, task: &WorkNumber) -> Result<Vec<WorkNumber>, ForemanError> {
        let t = self.require_task(task)?;
        Ok(t.depends_on
            .iter()
            .filter(|dep| {
                self.task(dep)
                    .map(|d| d.status != WorkStatus::Completed)
                    .unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    /// Readiness predicate: every dependency is completed.
    pub fn is_ready(&self, task: &WorkNumber) -> Result<bool, ForemanError> {
        Ok(self.unmet_dependencies(task)?.is_empty())
    }

    /// Issues that still have work and may be dispatched concurrently.
    pub fn dispatchable_issues(&self) -> Vec<&Issue> {
        self.issues
            .iter()
            .filter(|i| !i.status.is_terminal() && !i.tasks.is_empty())
            .collect()
    }

    /// Sibling issues grouped by parent prefix; each group may run concurrently.
    pub fn parallel_groups(&self) -> Vec<Vec<WorkNumber>> {
        let mut groups: Vec<(WorkNumber, Vec<WorkNumber>)> = Vec::new();
        for issue in &self.issues {
            let Some(parent) = issue.number.parent() else {
                continue;
            };
            match groups.iter_mut().find(|(p, _)| *p == parent) {
                Some((_, members)) => members.push(issue.number.clone()),
                None => groups.push((parent, vec![issue.number.clone()])),
            }
        }
        groups.into_iter().map(|(_, members)| members).collect()
    }

    pub fn all_completed(&self) -> bool {
        !self.issues.is_empty()
            && self
                .issues
                .iter()
                .all(|i| i.status == WorkStatus::Completed)
    }

    /// (completed tasks, total tasks)
    pub fn task_counts(&self) -> (usize, usize) {
        let tasks = self.issues.iter().flat_map(|i| i.tasks.iter());
        let (mut done, mut total) = (0, 0);
        for t in tasks {
            total += 1;
            if t.status == WorkStatus::Completed {
                done += 1;
            }
        }
        (done, total)
    }

    /// Check numbering, the sequential chain, and the dependency graph.
    ///
    /// - issue numbers have two segments under this scope; task numbers three
    ///   under their issue, contiguous from 1
    /// - every task after the first depends on its immediate predecessor
    /// - dependencies reference existing tasks and form no cycle
    pub fn validate(&self) -> Result<(), ForemanError> {
        let mut seen_issues = HashSet::new();
        let mut index: HashMap<&WorkNumber, usize> = HashMap::new();
        let mut all_tasks: Vec<&Task> = Vec::new();

        for issue in &self.issues {
            issue.number.expect_depth(ISSUE_DEPTH, "issue")?;
            if issue.number.segments()[0] != self.scope {
                return Err(ForemanError::validation(format!(
                    "issue {} is outside scope {}",
                    issue.number, self.scope
                )));
            }
            if !seen_issues.insert(&issue.number) {
                return Err(ForemanError::validation(format!(
                    "duplicate issue number {}",
                    issue.number
                )));
            }
            for (pos, task) in issue.tasks.iter().enumerate() {
                task.number.expect_depth(TASK_DEPTH, "task")?;
                let expected = issue.number.child(pos as u32 + 1);
                if task.number != expected || task.parent_issue != issue.number {
                    return Err(ForemanError::validation(format!(
                        "task {} is out of sequence in issue {} (expected {expected})",
                        task.number, issue.number
                    )));
                }
                if pos > 0 {
                    let pred = issue.number.child(pos as u32);
                    if !task.depends_on.contains(&pred) {
                        return Err(ForemanError::validation(format!(
                            "task {} must depend on its predecessor {pred}",
                            task.number
                        )));
                    }
                }
                index.insert(&task.number, all_tasks.len());
                all_tasks.push(task);
            }
        }

        // Kahn's algorithm over the task dependency edges.
        let mut in_degree = vec![0usize; all_tasks.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); all_tasks.len()];
        for (to, task) in all_tasks.iter().enumerate() {
            for dep in &task.depends_on {
                let from = *index.get(dep).ok_or_else(|| {
                    ForemanError::validation(format!(
                        "unknown dependency '{dep}' in task '{}'",
                        task.number
                    ))
                })?;
                dependents[from].push(to);
                in_degree[to] += 1;
            }
        }
        let mut queue: Vec<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, d)| *d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut processed = 0;
        while let Some(node) = queue.pop() {
            processed += 1;
            for &next in &dependents[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push(next);
                }
            }
        }
        if processed != all_tasks.len() {
            let cyclic: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, d)| *d > 0)
                .map(|(i, _)| all_tasks[i].number.to_string())
                .collect();
            return Err(ForemanError::validation(format!(
                "dependency cycle among tasks: {}",
                cyclic.join(", ")
            )));
        }

        Ok(())
    }
}

fn build_chain(issue: &WorkNumber, specs: &[TaskSpec]) -> Result<Vec<Task>, ForemanError> {
    let mut tasks: Vec<Task> = Vec::with_capacity(specs.len());
    for (pos, spec) in specs.iter().enumerate() {
        if spec.title.trim().is_empty() {
            return Err(ForemanError::validation(format!(
                "task {} of issue {issue} has an empty title",
                pos + 1
            )));
        }
        let mut task = Task::new(issue, pos as u32 + 1, &spec.title, &spec.description);
        if let Some(prev) = tasks.last() {
            task.depends_on.push(prev.number.clone());
        }
        tasks.push(task);
    }
    Ok(tasks)
}
