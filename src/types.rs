//! Core domain types for projects, branches, tasks and subtasks.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declares a string-backed enum with `as_str`, `Display`, `FromStr` and a
/// list of accepted values for error messages.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ::serde::Serialize, ::serde::Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn names() -> Vec<&'static str> {
                Self::ALL.iter().map(|v| v.as_str()).collect()
            }

            /// Comma separated list of accepted values.
            pub fn accepted() -> String {
                Self::ALL
                    .iter()
                    .map(|v| v.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                match s.trim().to_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!(
                        "invalid {} '{}', expected one of: {}",
                        stringify!($name),
                        other,
                        Self::accepted()
                    )),
                }
            }
        }
    };
}

pub(crate) use string_enum;

string_enum! {
    /// Lifecycle state of a task or subtask.
    TaskStatus {
        Todo => "todo",
        InProgress => "in_progress",
        Blocked => "blocked",
        Review => "review",
        Testing => "testing",
        Done => "done",
        Cancelled => "cancelled",
    }
}

impl TaskStatus {
    /// Terminal states do not count as outstanding work.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Cancelled)
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Todo
    }
}

string_enum! {
    /// Priority shared by branches, tasks and subtasks.
    Priority {
        Low => "low",
        Medium => "medium",
        High => "high",
        Urgent => "urgent",
        Critical => "critical",
    }
}

impl Priority {
    /// Numeric rank, higher is more important.
    pub fn rank(&self) -> i32 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
            Priority::Critical => 4,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

string_enum! {
    /// Coarse progress classification derived from the percentage.
    ProgressState {
        Initial => "initial",
        InProgress => "in_progress",
        Complete => "complete",
    }
}

impl ProgressState {
    pub fn from_percentage(percentage: i32) -> Self {
        match percentage {
            p if p <= 0 => ProgressState::Initial,
            p if p >= 100 => ProgressState::Complete,
            _ => ProgressState::InProgress,
        }
    }
}

string_enum! {
    ProjectStatus {
        Active => "active",
        Archived => "archived",
    }
}

impl Default for ProjectStatus {
    fn default() -> Self {
        ProjectStatus::Active
    }
}

/// A project owned by a single user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: String,
    pub user_id: String,
    pub status: ProjectStatus,
    pub metadata: Value,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A git branch, i.e. one task tree inside a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub assigned_agent_id: Option<String>,
    pub task_count: i64,
    pub completed_task_count: i64,
    pub user_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Branch {
    /// Percentage of tasks in the branch that are done.
    pub fn completion_percentage(&self) -> f64 {
        if self.task_count == 0 {
            0.0
        } else {
            (self.completed_task_count as f64 / self.task_count as f64) * 100.0
        }
    }
}

/// A single entry of a task's progress history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEntry {
    pub percentage: i32,
    pub state: ProgressState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub recorded_at: i64,
}

/// A task assignee with an optional role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assignee {
    pub assignee: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub assigned_at: i64,
}

/// A task inside a branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub branch_id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub details: String,
    pub estimated_effort: Option<String>,
    pub due_date: Option<String>,

    pub progress_percentage: i32,
    pub progress_state: ProgressState,
    pub progress_history: Vec<ProgressEntry>,

    // AI prompt fields
    pub ai_system_prompt: String,
    pub ai_request_prompt: String,
    pub ai_work_context: Value,

    // Completion metadata
    pub completion_summary: Option<String>,
    pub testing_notes: Option<String>,
    pub completed_at: Option<i64>,

    pub assignees: Vec<Assignee>,
    pub labels: Vec<String>,
    pub dependencies: Vec<String>,

    pub user_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A subtask of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub task_id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub assignees: Vec<String>,
    pub progress_percentage: i32,
    pub progress_notes: String,
    pub completion_summary: Option<String>,
    pub completed_at: Option<i64>,
    pub user_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for creating a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub branch_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub estimated_effort: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub assignees: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub ai_system_prompt: Option<String>,
    #[serde(default)]
    pub ai_request_prompt: Option<String>,
    #[serde(default)]
    pub ai_work_context: Option<Value>,
}

/// Partial update of a task. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub estimated_effort: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub assignees: Option<Vec<String>>,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    #[serde(default)]
    pub ai_system_prompt: Option<String>,
    #[serde(default)]
    pub ai_request_prompt: Option<String>,
    #[serde(default)]
    pub ai_work_context: Option<Value>,
}

impl TaskUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.status.is_none()
            && self.priority.is_none()
            && self.details.is_none()
            && self.estimated_effort.is_none()
            && self.due_date.is_none()
            && self.assignees.is_none()
            && self.labels.is_none()
            && self.ai_system_prompt.is_none()
            && self.ai_request_prompt.is_none()
            && self.ai_work_context.is_none()
    }
}

/// Partial update of a project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<ProjectStatus>,
    /// Deep-merged into the stored metadata.
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Partial update of a branch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BranchUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

/// Input for creating a subtask.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSubtask {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub assignees: Vec<String>,
}

/// Partial update of a subtask.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubtaskUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub assignees: Option<Vec<String>>,
    #[serde(default)]
    pub progress_percentage: Option<i32>,
    #[serde(default)]
    pub progress_notes: Option<String>,
}

/// Filters for listing tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    #[serde(default)]
    pub branch_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

/// Default and maximum page size for list endpoints.
pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 500;

/// Clamp a requested page size to `1..=MAX_PAGE_SIZE`.
pub fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

/// Row counts removed by a cascading delete.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeletionReport {
    pub subtasks: usize,
    pub assignees: usize,
    pub labels: usize,
    pub dependencies: usize,
    pub task_contexts: usize,
    pub tasks: usize,
    pub branch_contexts: usize,
    pub branches: usize,
    pub project_contexts: usize,
    pub projects: usize,
}

impl DeletionReport {
    pub fn absorb(&mut self, other: &DeletionReport) {
        self.subtasks += other.subtasks;
        self.assignees += other.assignees;
        self.labels += other.labels;
        self.dependencies += other.dependencies;
        self.task_contexts += other.task_contexts;
        self.tasks += other.tasks;
        self.branch_contexts += other.branch_contexts;
        self.branches += other.branches;
        self.project_contexts += other.project_contexts;
        self.projects += other.projects;
    }
}

/// Per-status task counts for a branch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BranchStatistics {
    pub branch_id: String,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub by_status: std::collections::BTreeMap<String, i64>,
    pub completion_percentage: f64,
    pub average_progress: f64,
}

/// Project overview with branch counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub project: Project,
    pub branch_count: i64,
    pub task_count: i64,
    pub completed_task_count: i64,
    pub completion_percentage: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("IN_PROGRESS".parse::<TaskStatus>().unwrap(), TaskStatus::InProgress);
        assert_eq!(" done ".parse::<TaskStatus>().unwrap(), TaskStatus::Done);
        let err = "finished".parse::<TaskStatus>().unwrap_err();
        assert!(err.contains("todo"));
    }

    #[test]
    fn priority_rank_orders_levels() {
        assert!(Priority::Critical.rank() > Priority::Urgent.rank());
        assert!(Priority::High.rank() > Priority::Medium.rank());
        assert!(Priority::Medium.rank() > Priority::Low.rank());
    }

    #[test]
    fn progress_state_follows_percentage() {
        assert_eq!(ProgressState::from_percentage(0), ProgressState::Initial);
        assert_eq!(ProgressState::from_percentage(42), ProgressState::InProgress);
        assert_eq!(ProgressState::from_percentage(100), ProgressState::Complete);
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn clamp_limit_bounds() {
        assert_eq!(clamp_limit(None), DEFAULT_PAGE_SIZE);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(10_000)), MAX_PAGE_SIZE);
    }
}
