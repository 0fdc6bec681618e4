//! Task progress tracking.
//!
//! Progress is a clamped percentage with a derived [`ProgressState`] and a
//! bounded history. Tasks with subtasks can have their progress recomputed
//! from the subtasks.

use super::Shared;
use super::tasks::TaskService;
use crate::context::ContextLevel;
use crate::db::now_ms;
use crate::error::{ApiError, ApiResult};
use crate::notifications::EventType;
use crate::types::{ProgressEntry, ProgressState, Task, TaskStatus};
use serde_json::json;
use tracing::{debug, info};

/// Entries kept in a task's progress history.
pub const MAX_PROGRESS_HISTORY: usize = 50;

pub struct TaskProgressService {
    shared: Shared,
}

impl TaskProgressService {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    /// Record a new progress value for a task.
    ///
    /// The value is clamped to 0–100. A `todo` task with progress moves to
    /// `in_progress`. Reaching 100 does not complete the task.
    pub fn update_progress(
        &self,
        user_id: &str,
        task_id: &str,
        percentage: i32,
        notes: Option<&str>,
    ) -> ApiResult<Task> {
        let task = self
            .shared
            .db
            .get_task(user_id, task_id)?
            .ok_or_else(|| ApiError::task_not_found(task_id))?;
        self.apply(task, percentage, notes.map(str::to_string))
    }

    /// Set a task's progress to the average of its subtasks' progress.
    ///
    /// Tasks without subtasks, and tasks already done, are returned unchanged.
    pub fn recalculate_from_subtasks(&self, user_id: &str, task_id: &str) -> ApiResult<Task> {
        let task = self
            .shared
            .db
            .get_task(user_id, task_id)?
            .ok_or_else(|| ApiError::task_not_found(task_id))?;
        let (done, total, average) = self.shared.db.subtask_progress(user_id, task_id)?;
        if total == 0 || task.status == TaskStatus::Done {
            return Ok(task);
        }

        let percentage = average.round() as i32;
        if percentage == task.progress_percentage {
            debug!(task_id, percentage, "Subtask progress unchanged");
            return Ok(task);
        }
        self.apply(
            task,
            percentage,
            Some(format!("Recalculated from subtasks ({}/{} done)", done, total)),
        )
    }

    fn apply(&self, task: Task, percentage: i32, notes: Option<String>) -> ApiResult<Task> {
        let percentage = percentage.clamp(0, 100);
        let state = ProgressState::from_percentage(percentage);
        let status = if task.status == TaskStatus::Todo && percentage > 0 {
            TaskStatus::InProgress
        } else {
            task.status
        };

        let mut history = task.progress_history;
        history.push(ProgressEntry {
            percentage,
            state,
            notes,
            recorded_at: now_ms(),
        });
        if history.len() > MAX_PROGRESS_HISTORY {
            let excess = history.len() - MAX_PROGRESS_HISTORY;
            history.drain(..excess);
        }

        let updated = self
            .shared
            .db
            .save_task_progress(&task.user_id, &task.id, status, percentage, state, &history)?
            .ok_or_else(|| ApiError::task_not_found(&task.id))?;
        self.shared
            .invalidate(&updated.user_id, ContextLevel::Task, &updated.id, "task progress updated");
        info!(
            user_id = %updated.user_id,
            task_id = %updated.id,
            percentage,
            state = %state,
            "Task progress updated"
        );
        self.shared.notify(
            TaskService::event(&self.shared, EventType::Updated, &updated)
                .data(json!({ "progress_percentage": percentage, "progress_state": state })),
        );
        Ok(updated)
    }
}
