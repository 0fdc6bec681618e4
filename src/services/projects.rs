use super::{Shared, required_text};
use crate::context::ContextLevel;
use crate::db::stats::UserOverview;
use crate::error::{ApiError, ApiResult};
use crate::notifications::{ChangeEvent, EntityType, EventType};
use crate::types::{DeletionReport, Project, ProjectStatus, ProjectSummary, ProjectUpdate};
use serde_json::{Value, json};
use tracing::info;

pub struct ProjectService {
    shared: Shared,
}

impl ProjectService {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    pub fn create(
        &self,
        user_id: &str,
        name: &str,
        description: Option<&str>,
        metadata: Option<Value>,
    ) -> ApiResult<Project> {
        let name = required_text("name", name)?;
        if let Some(ref metadata) = metadata
            && !metadata.is_object()
        {
            return Err(ApiError::invalid_value("metadata", "metadata must be a JSON object"));
        }

        let project = self
            .shared
            .db
            .create_project(user_id, &name, description.unwrap_or(""), metadata)?;
        info!(user_id, project_id = %project.id, name = %project.name, "Project created");
        self.shared.notify(
            ChangeEvent::new(EventType::Created, EntityType::Project, &project.id, user_id)
                .project(&project.id)
                .data(json!({ "name": project.name })),
        );
        Ok(project)
    }

    pub fn get(&self, user_id: &str, project_id: &str) -> ApiResult<Project> {
        self.shared
            .db
            .get_project(user_id, project_id)?
            .ok_or_else(|| ApiError::project_not_found(project_id))
    }

    pub fn list(
        &self,
        user_id: &str,
        status: Option<ProjectStatus>,
        limit: i64,
        offset: i64,
    ) -> ApiResult<Vec<Project>> {
        Ok(self.shared.db.list_projects(user_id, status, limit, offset.max(0))?)
    }

    pub fn update(&self, user_id: &str, project_id: &str, update: &ProjectUpdate) -> ApiResult<Project> {
        let mut update = update.clone();
        if let Some(ref name) = update.name {
            update.name = Some(required_text("name", name)?);
        }
        if let Some(ref metadata) = update.metadata
            && !metadata.is_object()
        {
            return Err(ApiError::invalid_value("metadata", "metadata must be a JSON object"));
        }

        let project = self
            .shared
            .db
            .update_project(user_id, project_id, &update)?
            .ok_or_else(|| ApiError::project_not_found(project_id))?;
        self.shared
            .invalidate(user_id, ContextLevel::Project, project_id, "project updated");
        info!(user_id, project_id, "Project updated");
        self.shared.notify(
            ChangeEvent::new(EventType::Updated, EntityType::Project, project_id, user_id).project(project_id),
        );
        Ok(project)
    }

    /// Delete a project with all of its branches, tasks and contexts.
    pub fn delete(&self, user_id: &str, project_id: &str) -> ApiResult<DeletionReport> {
        // Resolve descendants while they still exist
        self.shared
            .invalidate(user_id, ContextLevel::Project, project_id, "project deleted");
        let report = self
            .shared
            .db
            .delete_project(user_id, project_id)?
            .ok_or_else(|| ApiError::project_not_found(project_id))?;
        info!(
            user_id,
            project_id,
            branches = report.branches,
            tasks = report.tasks,
            "Project deleted"
        );
        self.shared.notify(
            ChangeEvent::new(EventType::Deleted, EntityType::Project, project_id, user_id)
                .project(project_id)
                .data(json!(report)),
        );
        Ok(report)
    }

    pub fn summary(&self, user_id: &str, project_id: &str) -> ApiResult<ProjectSummary> {
        self.shared
            .db
            .project_summary(user_id, project_id)?
            .ok_or_else(|| ApiError::project_not_found(project_id))
    }

    /// Row counts across everything the user owns.
    pub fn overview(&self, user_id: &str) -> ApiResult<UserOverview> {
        Ok(self.shared.db.user_overview(user_id)?)
    }
}
