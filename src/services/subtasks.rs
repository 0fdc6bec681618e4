use super::progress::TaskProgressService;
use super::{Shared, required_text};
use crate::error::{ApiError, ApiResult};
use crate::notifications::{ChangeEvent, EntityType, EventType};
use crate::types::{NewSubtask, Subtask, SubtaskUpdate, Task};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

pub struct SubtaskService {
    shared: Shared,
    progress: Arc<TaskProgressService>,
}

impl SubtaskService {
    pub(crate) fn new(shared: Shared, progress: Arc<TaskProgressService>) -> Self {
        Self { shared, progress }
    }

    fn event(&self, event_type: EventType, subtask: &Subtask) -> ChangeEvent {
        ChangeEvent::new(event_type, EntityType::Subtask, &subtask.id, &subtask.user_id)
            .data(json!({ "task_id": subtask.task_id, "status": subtask.status }))
    }

    /// Recompute the parent task's progress. The subtask change already
    /// happened, so a failure here is only logged.
    fn refresh_parent(&self, user_id: &str, task_id: &str) -> Option<Task> {
        match self.progress.recalculate_from_subtasks(user_id, task_id) {
            Ok(task) => Some(task),
            Err(e) => {
                warn!(user_id, task_id, error = %e, "Failed to recalculate task progress");
                None
            }
        }
    }

    pub fn create(&self, user_id: &str, task_id: &str, mut input: NewSubtask) -> ApiResult<Subtask> {
        input.title = required_text("title", &input.title)?;
        let subtask = self.shared.db.create_subtask(user_id, task_id, &input)?;
        info!(user_id, task_id, subtask_id = %subtask.id, "Subtask created");
        self.refresh_parent(user_id, task_id);
        self.shared.notify(self.event(EventType::Created, &subtask));
        Ok(subtask)
    }

    pub fn get(&self, user_id: &str, task_id: &str, subtask_id: &str) -> ApiResult<Subtask> {
        self.shared
            .db
            .get_subtask(user_id, task_id, subtask_id)?
            .ok_or_else(|| ApiError::subtask_not_found(subtask_id))
    }

    pub fn list(&self, user_id: &str, task_id: &str) -> ApiResult<Vec<Subtask>> {
        self.shared
            .db
            .list_subtasks(user_id, task_id)?
            .ok_or_else(|| ApiError::task_not_found(task_id))
    }

    pub fn update(
        &self,
        user_id: &str,
        task_id: &str,
        subtask_id: &str,
        update: &SubtaskUpdate,
    ) -> ApiResult<Subtask> {
        let mut update = update.clone();
        if let Some(ref title) = update.title {
            update.title = Some(required_text("title", title)?);
        }
        let subtask = self
            .shared
            .db
            .update_subtask(user_id, task_id, subtask_id, &update)?
            .ok_or_else(|| ApiError::subtask_not_found(subtask_id))?;
        info!(user_id, task_id, subtask_id, status = %subtask.status, "Subtask updated");
        self.refresh_parent(user_id, task_id);
        self.shared.notify(self.event(EventType::Updated, &subtask));
        Ok(subtask)
    }

    pub fn complete(
        &self,
        user_id: &str,
        task_id: &str,
        subtask_id: &str,
        completion_summary: Option<&str>,
    ) -> ApiResult<Subtask> {
        let subtask = self
            .shared
            .db
            .complete_subtask(user_id, task_id, subtask_id, completion_summary)?
            .ok_or_else(|| ApiError::subtask_not_found(subtask_id))?;
        info!(user_id, task_id, subtask_id, "Subtask completed");
        self.refresh_parent(user_id, task_id);
        self.shared.notify(self.event(EventType::Completed, &subtask));
        Ok(subtask)
    }

    pub fn delete(&self, user_id: &str, task_id: &str, subtask_id: &str) -> ApiResult<()> {
        let subtask = self.get(user_id, task_id, subtask_id)?;
        if !self.shared.db.delete_subtask(user_id, task_id, subtask_id)? {
            return Err(ApiError::subtask_not_found(subtask_id));
        }
        info!(user_id, task_id, subtask_id, "Subtask deleted");
        self.refresh_parent(user_id, task_id);
        self.shared.notify(self.event(EventType::Deleted, &subtask));
        Ok(())
    }
}
