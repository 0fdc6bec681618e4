use super::{Shared, required_text};
use crate::context::ContextLevel;
use crate::error::{ApiError, ApiResult};
use crate::notifications::{ChangeEvent, EntityType, EventType};
use crate::types::{Branch, BranchStatistics, BranchUpdate, DeletionReport, Priority};
use serde_json::json;
use tracing::info;

pub struct BranchService {
    shared: Shared,
}

impl BranchService {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    fn event(&self, event_type: EventType, branch: &Branch) -> ChangeEvent {
        ChangeEvent::new(event_type, EntityType::Branch, &branch.id, &branch.user_id)
            .project(&branch.project_id)
            .branch(&branch.id)
    }

    pub fn create(
        &self,
        user_id: &str,
        project_id: &str,
        name: &str,
        description: Option<&str>,
        priority: Option<Priority>,
    ) -> ApiResult<Branch> {
        let name = required_text("name", name)?;
        let branch = self.shared.db.create_branch(
            user_id,
            project_id,
            &name,
            description.unwrap_or(""),
            priority.unwrap_or_default(),
        )?;
        info!(user_id, project_id, branch_id = %branch.id, name = %branch.name, "Branch created");
        self.shared
            .notify(self.event(EventType::Created, &branch).data(json!({ "name": branch.name })));
        Ok(branch)
    }

    pub fn get(&self, user_id: &str, branch_id: &str) -> ApiResult<Branch> {
        self.shared
            .db
            .get_branch(user_id, branch_id)?
            .ok_or_else(|| ApiError::branch_not_found(branch_id))
    }

    pub fn list(
        &self,
        user_id: &str,
        project_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> ApiResult<Vec<Branch>> {
        if let Some(project_id) = project_id
            && self.shared.db.get_project(user_id, project_id)?.is_none()
        {
            return Err(ApiError::project_not_found(project_id));
        }
        Ok(self
            .shared
            .db
            .list_branches(user_id, project_id, limit, offset.max(0))?)
    }

    pub fn update(&self, user_id: &str, branch_id: &str, update: &BranchUpdate) -> ApiResult<Branch> {
        let mut update = update.clone();
        if let Some(ref name) = update.name {
            update.name = Some(required_text("name", name)?);
        }
        let branch = self
            .shared
            .db
            .update_branch(user_id, branch_id, &update)?
            .ok_or_else(|| ApiError::branch_not_found(branch_id))?;
        self.shared
            .invalidate(user_id, ContextLevel::Branch, branch_id, "branch updated");
        info!(user_id, branch_id, "Branch updated");
        self.shared.notify(self.event(EventType::Updated, &branch));
        Ok(branch)
    }

    pub fn assign_agent(&self, user_id: &str, branch_id: &str, agent_id: &str) -> ApiResult<Branch> {
        let agent_id = required_text("agent_id", agent_id)?;
        let branch = self
            .shared
            .db
            .set_branch_agent(user_id, branch_id, Some(&agent_id))?
            .ok_or_else(|| ApiError::branch_not_found(branch_id))?;
        info!(user_id, branch_id, agent_id = %agent_id, "Agent assigned to branch");
        self.shared.notify(
            self.event(EventType::Updated, &branch)
                .data(json!({ "assigned_agent_id": agent_id })),
        );
        Ok(branch)
    }

    pub fn unassign_agent(&self, user_id: &str, branch_id: &str) -> ApiResult<Branch> {
        let branch = self
            .shared
            .db
            .set_branch_agent(user_id, branch_id, None)?
            .ok_or_else(|| ApiError::branch_not_found(branch_id))?;
        info!(user_id, branch_id, "Agent unassigned from branch");
        self.shared.notify(
            self.event(EventType::Updated, &branch)
                .data(json!({ "assigned_agent_id": null })),
        );
        Ok(branch)
    }

    /// Delete a branch with its tasks, subtasks and contexts.
    pub fn delete(&self, user_id: &str, branch_id: &str) -> ApiResult<DeletionReport> {
        let branch = self.get(user_id, branch_id)?;
        self.shared
            .invalidate(user_id, ContextLevel::Branch, branch_id, "branch deleted");
        let report = self
            .shared
            .db
            .delete_branch(user_id, branch_id)?
            .ok_or_else(|| ApiError::branch_not_found(branch_id))?;
        info!(user_id, branch_id, tasks = report.tasks, subtasks = report.subtasks, "Branch deleted");
        self.shared
            .notify(self.event(EventType::Deleted, &branch).data(json!(report)));
        Ok(report)
    }

    pub fn statistics(&self, user_id: &str, branch_id: &str) -> ApiResult<BranchStatistics> {
        self.shared
            .db
            .branch_statistics(user_id, branch_id)?
            .ok_or_else(|| ApiError::branch_not_found(branch_id))
    }
}
