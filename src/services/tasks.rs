use super::{Shared, required_text};
use crate::context::ContextLevel;
use crate::error::{ApiError, ApiResult};
use crate::notifications::{ChangeEvent, EntityType, EventType};
use crate::types::{DeletionReport, NewTask, Task, TaskFilter, TaskUpdate, clamp_limit};
use serde_json::json;
use tracing::info;

pub struct TaskService {
    shared: Shared,
}

/// One page of tasks.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

impl TaskService {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    /// Change event for a task, tagged with its branch and project.
    pub(crate) fn event(shared: &Shared, event_type: EventType, task: &Task) -> ChangeEvent {
        let mut event = ChangeEvent::new(event_type, EntityType::Task, &task.id, &task.user_id)
            .branch(&task.branch_id);
        if let Ok(Some(branch)) = shared.db.get_branch(&task.user_id, &task.branch_id) {
            event = event.project(&branch.project_id);
        }
        event
    }

    pub fn create(&self, user_id: &str, mut input: NewTask) -> ApiResult<Task> {
        input.title = required_text("title", &input.title)?;
        if input.branch_id.trim().is_empty() {
            return Err(ApiError::missing_field("branch_id"));
        }
        if let Some(ref context) = input.ai_work_context
            && !context.is_object()
        {
            return Err(ApiError::invalid_value("ai_work_context", "ai_work_context must be a JSON object"));
        }

        let task = self.shared.db.create_task(user_id, &input)?;
        info!(user_id, task_id = %task.id, branch_id = %task.branch_id, "Task created");
        self.shared.notify(
            Self::event(&self.shared, EventType::Created, &task).data(json!({ "title": task.title })),
        );
        Ok(task)
    }

    pub fn get(&self, user_id: &str, task_id: &str) -> ApiResult<Task> {
        self.shared
            .db
            .get_task(user_id, task_id)?
            .ok_or_else(|| ApiError::task_not_found(task_id))
    }

    pub fn list(&self, user_id: &str, filter: &TaskFilter) -> ApiResult<TaskPage> {
        let mut filter = filter.clone();
        let limit = clamp_limit(filter.limit);
        let offset = filter.offset.unwrap_or(0).max(0);
        filter.limit = Some(limit);
        filter.offset = Some(offset);
        let (tasks, total) = self.shared.db.list_tasks(user_id, &filter)?;
        Ok(TaskPage {
            tasks,
            total,
            limit,
            offset,
        })
    }

    pub fn update(&self, user_id: &str, task_id: &str, update: &TaskUpdate) -> ApiResult<Task> {
        if update.is_empty() {
            return Err(ApiError::invalid_value("update", "No fields to update"));
        }
        let mut update = update.clone();
        if let Some(ref title) = update.title {
            update.title = Some(required_text("title", title)?);
        }

        let task = self
            .shared
            .db
            .update_task(user_id, task_id, &update)?
            .ok_or_else(|| ApiError::task_not_found(task_id))?;
        self.shared
            .invalidate(user_id, ContextLevel::Task, task_id, "task updated");
        info!(user_id, task_id, status = %task.status, "Task updated");
        self.shared
            .notify(Self::event(&self.shared, EventType::Updated, &task));
        Ok(task)
    }

    pub fn delete(&self, user_id: &str, task_id: &str) -> ApiResult<DeletionReport> {
        let task = self.get(user_id, task_id)?;
        self.shared
            .invalidate(user_id, ContextLevel::Task, task_id, "task deleted");
        let report = self
            .shared
            .db
            .delete_task(user_id, task_id)?
            .ok_or_else(|| ApiError::task_not_found(task_id))?;
        info!(user_id, task_id, subtasks = report.subtasks, "Task deleted");
        self.shared
            .notify(Self::event(&self.shared, EventType::Deleted, &task));
        Ok(report)
    }

    /// Mark a task done. Every subtask must be done first.
    pub fn complete(
        &self,
        user_id: &str,
        task_id: &str,
        completion_summary: Option<&str>,
        testing_notes: Option<&str>,
    ) -> ApiResult<Task> {
        let task = self
            .shared
            .db
            .complete_task(user_id, task_id, completion_summary, testing_notes)?
            .ok_or_else(|| ApiError::task_not_found(task_id))?;
        self.shared
            .invalidate(user_id, ContextLevel::Task, task_id, "task completed");
        info!(user_id, task_id, "Task completed");
        self.shared.notify(
            Self::event(&self.shared, EventType::Completed, &task)
                .data(json!({ "completion_summary": task.completion_summary })),
        );
        Ok(task)
    }

    pub fn add_dependency(&self, user_id: &str, task_id: &str, depends_on: &str) -> ApiResult<Task> {
        if task_id == depends_on {
            return Err(ApiError::dependency_cycle(task_id, depends_on));
        }
        self.shared.db.add_task_dependency(user_id, task_id, depends_on)?;
        let task = self.get(user_id, task_id)?;
        info!(user_id, task_id, depends_on, "Dependency added");
        self.shared.notify(
            Self::event(&self.shared, EventType::Updated, &task).data(json!({ "dependencies": task.dependencies })),
        );
        Ok(task)
    }

    pub fn remove_dependency(&self, user_id: &str, task_id: &str, depends_on: &str) -> ApiResult<Task> {
        if !self.shared.db.remove_task_dependency(user_id, task_id, depends_on)? {
            return Err(ApiError::task_not_found(depends_on)
                .with_details(format!("Task {} does not depend on {}", task_id, depends_on)));
        }
        let task = self.get(user_id, task_id)?;
        info!(user_id, task_id, depends_on, "Dependency removed");
        self.shared.notify(
            Self::event(&self.shared, EventType::Updated, &task).data(json!({ "dependencies": task.dependencies })),
        );
        Ok(task)
    }

    /// Next actionable task, optionally within a branch or project.
    pub fn next(
        &self,
        user_id: &str,
        branch_id: Option<&str>,
        project_id: Option<&str>,
    ) -> ApiResult<Option<Task>> {
        Ok(self.shared.db.next_task(user_id, branch_id, project_id)?)
    }

    /// Unfinished tasks that `task_id` waits on.
    pub fn blockers(&self, user_id: &str, task_id: &str) -> ApiResult<Vec<String>> {
        self.get(user_id, task_id)?;
        Ok(self.shared.db.open_blockers(user_id, task_id)?)
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ErrorCode;
    use crate::services::Services;
    use crate::types::{NewSubtask, NewTask, Priority, ProgressState, TaskFilter, TaskStatus, TaskUpdate};

    fn setup() -> (Services, String) {
        let services = Services::in_memory().unwrap();
        let project = services.projects.create("u1", "alpha", None, None).unwrap();
        let branch = services.branches.create("u1", &project.id, "main", None, None).unwrap();
        (services, branch.id)
    }

    fn new_task(branch_id: &str, title: &str, priority: Priority) -> NewTask {
        NewTask {
            branch_id: branch_id.to_string(),
            title: title.to_string(),
            priority: Some(priority),
            ..Default::default()
        }
    }

    #[test]
    fn branch_counters_follow_completion() {
        let (services, branch_id) = setup();
        let a = services.tasks.create("u1", new_task(&branch_id, "a", Priority::Low)).unwrap();
        services.tasks.create("u1", new_task(&branch_id, "b", Priority::Low)).unwrap();
        services.tasks.complete("u1", &a.id, Some("done"), None).unwrap();

        let branch = services.branches.get("u1", &branch_id).unwrap();
        assert_eq!(branch.task_count, 2);
        assert_eq!(branch.completed_task_count, 1);

        services.tasks.delete("u1", &a.id).unwrap();
        let branch = services.branches.get("u1", &branch_id).unwrap();
        assert_eq!(branch.task_count, 1);
        assert_eq!(branch.completed_task_count, 0);
    }

    #[test]
    fn completion_requires_done_subtasks() {
        let (services, branch_id) = setup();
        let task = services.tasks.create("u1", new_task(&branch_id, "a", Priority::Low)).unwrap();
        let subtask = services
            .subtasks
            .create(
                "u1",
                &task.id,
                NewSubtask {
                    title: "step".into(),
                    ..Default::default()
                },
            )
            .unwrap();

        let err = services.tasks.complete("u1", &task.id, None, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidState);
        let err = services
            .tasks
            .update(
                "u1",
                &task.id,
                &TaskUpdate {
                    status: Some(TaskStatus::Done),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidState);

        services.subtasks.complete("u1", &task.id, &subtask.id, None).unwrap();
        let done = services.tasks.complete("u1", &task.id, Some("shipped"), Some("unit tests")).unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.testing_notes.as_deref(), Some("unit tests"));
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn next_respects_dependencies_and_priority() {
        let (services, branch_id) = setup();
        let setup_db = services.tasks.create("u1", new_task(&branch_id, "db", Priority::Low)).unwrap();
        let api = services.tasks.create("u1", new_task(&branch_id, "api", Priority::Critical)).unwrap();
        services.tasks.add_dependency("u1", &api.id, &setup_db.id).unwrap();

        let next = services.tasks.next("u1", Some(&branch_id), None).unwrap().unwrap();
        assert_eq!(next.id, setup_db.id);
        assert_eq!(services.tasks.blockers("u1", &api.id).unwrap(), vec![setup_db.id.clone()]);

        services.tasks.complete("u1", &setup_db.id, None, None).unwrap();
        let next = services.tasks.next("u1", None, None).unwrap().unwrap();
        assert_eq!(next.id, api.id);
    }

    #[test]
    fn dependency_cycles_are_rejected() {
        let (services, branch_id) = setup();
        let a = services.tasks.create("u1", new_task(&branch_id, "a", Priority::Low)).unwrap();
        let b = services.tasks.create("u1", new_task(&branch_id, "b", Priority::Low)).unwrap();
        services.tasks.add_dependency("u1", &a.id, &b.id).unwrap();
        let err = services.tasks.add_dependency("u1", &b.id, &a.id).unwrap_err();
        assert_eq!(err.code, ErrorCode::DependencyCycle);
        let err = services.tasks.add_dependency("u1", &a.id, &a.id).unwrap_err();
        assert_eq!(err.code, ErrorCode::DependencyCycle);

        let task = services.tasks.remove_dependency("u1", &a.id, &b.id).unwrap();
        assert!(task.dependencies.is_empty());
        assert!(services.tasks.remove_dependency("u1", &a.id, &b.id).is_err());
    }

    #[test]
    fn list_filters_and_pages() {
        let (services, branch_id) = setup();
        for i in 0..5 {
            services
                .tasks
                .create("u1", new_task(&branch_id, &format!("t{}", i), Priority::Medium))
                .unwrap();
        }
        let page = services
            .tasks
            .list(
                "u1",
                &TaskFilter {
                    branch_id: Some(branch_id.clone()),
                    limit: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page.tasks.len(), 2);
        assert_eq!(page.total, 5);
        assert!(services.tasks.list("u2", &TaskFilter::default()).unwrap().tasks.is_empty());
    }

    #[test]
    fn empty_update_is_rejected() {
        let (services, branch_id) = setup();
        let task = services.tasks.create("u1", new_task(&branch_id, "a", Priority::Low)).unwrap();
        let err = services.tasks.update("u1", &task.id, &TaskUpdate::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidFieldValue);
    }

    #[test]
    fn marking_done_through_update_records_completion() {
        let (services, branch_id) = setup();
        let task = services.tasks.create("u1", new_task(&branch_id, "a", Priority::Low)).unwrap();
        let done = services
            .tasks
            .update(
                "u1",
                &task.id,
                &TaskUpdate {
                    status: Some(TaskStatus::Done),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.progress_percentage, 100);
        assert_eq!(done.progress_state, ProgressState::Complete);
        assert!(done.completed_at.is_some());
        let last = done.progress_history.last().unwrap();
        assert_eq!(last.percentage, 100);

        let branch = services.branches.get("u1", &branch_id).unwrap();
        assert_eq!(branch.completed_task_count, 1);
    }
}
