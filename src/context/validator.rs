//! Hierarchy checks before a context is created.
//!
//! The entity behind a context must exist. Missing parent contexts are only
//! reported, together with the steps needed to create them.

use super::ContextLevel;
use crate::db::Database;
use crate::error::{ApiError, ApiResult};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingContext {
    pub level: ContextLevel,
    pub id: String,
}

/// Result of validating one context position in the hierarchy.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub level: ContextLevel,
    pub id: String,
    /// True when every parent context exists.
    pub valid: bool,
    /// Missing parent contexts, root first.
    pub missing: Vec<MissingContext>,
    /// One instruction per missing context, in creation order.
    pub guidance: Vec<String>,
}

pub struct ContextHierarchyValidator {
    db: Database,
}

fn entity_not_found(level: ContextLevel, id: &str) -> ApiError {
    match level {
        ContextLevel::Global => ApiError::context_not_found(level.as_str(), id),
        ContextLevel::Project => ApiError::project_not_found(id),
        ContextLevel::Branch => ApiError::branch_not_found(id),
        ContextLevel::Task => ApiError::task_not_found(id),
    }
}

impl ContextHierarchyValidator {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Entity ids above `(level, id)`, nearest first. Each step follows the
    /// entity relation (task → branch → project → user).
    pub fn ancestors(
        &self,
        level: ContextLevel,
        id: &str,
        user_id: &str,
    ) -> ApiResult<Vec<(ContextLevel, String)>> {
        let mut out = Vec::new();
        let mut current = (level, id.to_string());
        while let Some(parent_level) = current.0.parent() {
            let Some(parent_id) = self.db.context_entity_parent(current.0, &current.1, user_id)? else {
                break;
            };
            out.push((parent_level, parent_id.clone()));
            current = (parent_level, parent_id);
        }
        Ok(out)
    }

    /// Check that the entity exists for this user and report missing parent
    /// contexts. Only a missing entity is an error.
    pub fn validate(&self, level: ContextLevel, id: &str, user_id: &str) -> ApiResult<ValidationOutcome> {
        if !self.db.context_entity_exists(level, id, user_id)? {
            return Err(entity_not_found(level, id));
        }

        let mut missing = Vec::new();
        for (parent_level, parent_id) in self.ancestors(level, id, user_id)? {
            if self.db.get_context(parent_level, &parent_id, user_id)?.is_none() {
                missing.push(MissingContext {
                    level: parent_level,
                    id: parent_id,
                });
            }
        }
        missing.reverse();

        let guidance = missing
            .iter()
            .enumerate()
            .map(|(step, m)| {
                format!(
                    "Step {}: create the {} context first: manage_context(action=\"create\", level=\"{}\", context_id=\"{}\")",
                    step + 1,
                    m.level,
                    m.level,
                    if m.level == ContextLevel::Global { "global" } else { m.id.as_str() }
                )
            })
            .collect();

        Ok(ValidationOutcome {
            level,
            id: id.to_string(),
            valid: missing.is_empty(),
            missing,
            guidance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextRecord;
    use crate::db::now_ms;
    use crate::error::ErrorCode;
    use crate::types::{NewTask, Priority};

    fn setup() -> (Database, String, String, String) {
        let db = Database::open_in_memory().unwrap();
        let project = db.create_project("u1", "alpha", "", None).unwrap();
        let branch = db
            .create_branch("u1", &project.id, "main", "", Priority::Medium)
            .unwrap();
        let task = db
            .create_task(
                "u1",
                &NewTask {
                    branch_id: branch.id.clone(),
                    title: "t".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        (db, project.id, branch.id, task.id)
    }

    #[test]
    fn missing_parents_are_reported_root_first() {
        let (db, project_id, branch_id, task_id) = setup();
        let validator = ContextHierarchyValidator::new(db);
        let outcome = validator.validate(ContextLevel::Task, &task_id, "u1").unwrap();
        assert!(!outcome.valid);
        let levels: Vec<_> = outcome.missing.iter().map(|m| m.level).collect();
        assert_eq!(
            levels,
            vec![ContextLevel::Global, ContextLevel::Project, ContextLevel::Branch]
        );
        assert_eq!(outcome.missing[1].id, project_id);
        assert_eq!(outcome.missing[2].id, branch_id);
        assert_eq!(outcome.guidance.len(), 3);
        assert!(outcome.guidance[0].starts_with("Step 1"));
    }

    #[test]
    fn existing_parents_validate() {
        let (db, project_id, _, _) = setup();
        db.insert_context(&ContextRecord::new(ContextLevel::Global, "u1", None, "u1", now_ms()))
            .unwrap();
        let validator = ContextHierarchyValidator::new(db);
        let outcome = validator.validate(ContextLevel::Project, &project_id, "u1").unwrap();
        assert!(outcome.valid);
        assert!(outcome.guidance.is_empty());
    }

    #[test]
    fn unknown_entity_is_not_found() {
        let (db, _, _, task_id) = setup();
        let validator = ContextHierarchyValidator::new(db);
        let err = validator.validate(ContextLevel::Branch, "nope", "u1").unwrap_err();
        assert_eq!(err.code, ErrorCode::BranchNotFound);
        // Other tenants cannot see the task
        let err = validator.validate(ContextLevel::Task, &task_id, "u2").unwrap_err();
        assert_eq!(err.code, ErrorCode::TaskNotFound);
    }
}
