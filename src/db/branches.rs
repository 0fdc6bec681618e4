//! Branch (task tree) persistence, counters and the deletion sequence.

use super::projects::get_project_internal;
use super::{Database, new_id, now_ms, optional, parse_column};
use crate::error::ApiError;
use crate::types::{Branch, BranchStatistics, BranchUpdate, DeletionReport, Priority, TaskStatus};
use anyhow::Result;
use rusqlite::{Connection, Row, params};
use std::collections::BTreeMap;

fn parse_branch_row(row: &Row) -> rusqlite::Result<Branch> {
    Ok(Branch {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        status: parse_column("status", row.get("status")?)?,
        priority: parse_column("priority", row.get("priority")?)?,
        assigned_agent_id: row.get("assigned_agent_id")?,
        task_count: row.get("task_count")?,
        completed_task_count: row.get("completed_task_count")?,
        user_id: row.get("user_id")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub(crate) fn get_branch_internal(
    conn: &Connection,
    user_id: &str,
    branch_id: &str,
) -> Result<Option<Branch>> {
    optional(conn.query_row(
        "SELECT * FROM branches WHERE id = ?1 AND user_id = ?2",
        params![branch_id, user_id],
        parse_branch_row,
    ))
}

fn name_taken(conn: &Connection, project_id: &str, name: &str, except: Option<&str>) -> Result<bool> {
    let found: Option<String> = optional(conn.query_row(
        "SELECT id FROM branches WHERE project_id = ?1 AND name = ?2",
        params![project_id, name],
        |row| row.get(0),
    ))?;
    Ok(matches!(found, Some(id) if Some(id.as_str()) != except))
}

/// Recompute `task_count` / `completed_task_count` from the tasks table.
pub(crate) fn refresh_branch_counters(conn: &Connection, branch_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE branches SET
             task_count = (SELECT COUNT(*) FROM tasks WHERE branch_id = ?1),
             completed_task_count = (SELECT COUNT(*) FROM tasks WHERE branch_id = ?1 AND status = 'done'),
             updated_at = ?2
         WHERE id = ?1",
        params![branch_id, now_ms()],
    )?;
    Ok(())
}

/// Delete one branch and everything it owns, on an open transaction.
///
/// Order: subtasks, assignees, labels, dependencies (both directions), task
/// contexts, tasks, branch context, branch.
pub(crate) fn delete_branch_tx(
    conn: &Connection,
    user_id: &str,
    branch_id: &str,
) -> Result<DeletionReport> {
    const BRANCH_TASKS: &str = "SELECT id FROM tasks WHERE branch_id = ?1";
    let mut report = DeletionReport::default();

    report.subtasks = conn.execute(
        &format!("DELETE FROM subtasks WHERE task_id IN ({})", BRANCH_TASKS),
        params![branch_id],
    )?;
    report.assignees = conn.execute(
        &format!("DELETE FROM task_assignees WHERE task_id IN ({})", BRANCH_TASKS),
        params![branch_id],
    )?;
    report.labels = conn.execute(
        &format!("DELETE FROM task_labels WHERE task_id IN ({})", BRANCH_TASKS),
        params![branch_id],
    )?;
    report.dependencies = conn.execute(
        &format!(
            "DELETE FROM task_dependencies
             WHERE task_id IN ({0}) OR depends_on_task_id IN ({0})",
            BRANCH_TASKS
        ),
        params![branch_id],
    )?;
    conn.execute(
        &format!(
            "DELETE FROM context_inheritance_cache
             WHERE user_id = ?2 AND context_level = 'task' AND context_id IN ({})",
            BRANCH_TASKS
        ),
        params![branch_id, user_id],
    )?;
    report.task_contexts = conn.execute(
        &format!("DELETE FROM task_contexts WHERE id IN ({})", BRANCH_TASKS),
        params![branch_id],
    )?;
    report.tasks = conn.execute(
        "DELETE FROM tasks WHERE branch_id = ?1 AND user_id = ?2",
        params![branch_id, user_id],
    )?;
    conn.execute(
        "DELETE FROM context_inheritance_cache
         WHERE user_id = ?2 AND context_level = 'branch' AND context_id = ?1",
        params![branch_id, user_id],
    )?;
    report.branch_contexts = conn.execute(
        "DELETE FROM branch_contexts WHERE id = ?1 AND user_id = ?2",
        params![branch_id, user_id],
    )?;
    report.branches = conn.execute(
        "DELETE FROM branches WHERE id = ?1 AND user_id = ?2",
        params![branch_id, user_id],
    )?;

    Ok(report)
}

impl Database {
    /// Create a branch inside one of the user's projects.
    pub fn create_branch(
        &self,
        user_id: &str,
        project_id: &str,
        name: &str,
        description: &str,
        priority: Priority,
    ) -> Result<Branch> {
        let now = now_ms();
        let branch = Branch {
            id: new_id(),
            project_id: project_id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            status: TaskStatus::Todo,
            priority,
            assigned_agent_id: None,
            task_count: 0,
            completed_task_count: 0,
            user_id: user_id.to_string(),
            created_at: now,
            updated_at: now,
        };

        self.with_conn(|conn| {
            if get_project_internal(conn, user_id, project_id)?.is_none() {
                return Err(ApiError::project_not_found(project_id).into());
            }
            if name_taken(conn, project_id, name, None)? {
                return Err(ApiError::already_exists(format!(
                    "Branch '{}' already exists in this project",
                    name
                ))
                .into());
            }
            conn.execute(
                "INSERT INTO branches (id, project_id, name, description, status, priority,
                     task_count, completed_task_count, user_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, ?7, ?8, ?9)",
                params![
                    &branch.id,
                    &branch.project_id,
                    &branch.name,
                    &branch.description,
                    branch.status.as_str(),
                    branch.priority.as_str(),
                    &branch.user_id,
                    branch.created_at,
                    branch.updated_at,
                ],
            )?;
            Ok(())
        })?;

        Ok(branch)
    }

    pub fn get_branch(&self, user_id: &str, branch_id: &str) -> Result<Option<Branch>> {
        self.with_conn(|conn| get_branch_internal(conn, user_id, branch_id))
    }

    /// List branches, optionally restricted to one project.
    pub fn list_branches(
        &self,
        user_id: &str,
        project_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Branch>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM branches
                 WHERE user_id = ?1 AND (?2 IS NULL OR project_id = ?2)
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?3 OFFSET ?4",
            )?;
            let branches = stmt
                .query_map(params![user_id, project_id, limit, offset], parse_branch_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(branches)
        })
    }

    pub fn update_branch(
        &self,
        user_id: &str,
        branch_id: &str,
        update: &BranchUpdate,
    ) -> Result<Option<Branch>> {
        let now = now_ms();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let Some(mut branch) = get_branch_internal(&tx, user_id, branch_id)? else {
                return Ok(None);
            };

            if let Some(ref name) = update.name {
                if name_taken(&tx, &branch.project_id, name, Some(branch_id))? {
                    return Err(ApiError::already_exists(format!(
                        "Branch '{}' already exists in this project",
                        name
                    ))
                    .into());
                }
                branch.name = name.clone();
            }
            if let Some(ref description) = update.description {
                branch.description = description.clone();
            }
            if let Some(status) = update.status {
                branch.status = status;
            }
            if let Some(priority) = update.priority {
                branch.priority = priority;
            }
            branch.updated_at = now;

            tx.execute(
                "UPDATE branches SET name = ?1, description = ?2, status = ?3, priority = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    &branch.name,
                    &branch.description,
                    branch.status.as_str(),
                    branch.priority.as_str(),
                    now,
                    branch_id,
                ],
            )?;
            tx.commit()?;
            Ok(Some(branch))
        })
    }

    /// Set or clear the agent assigned to a branch.
    pub fn set_branch_agent(
        &self,
        user_id: &str,
        branch_id: &str,
        agent_id: Option<&str>,
    ) -> Result<Option<Branch>> {
        let now = now_ms();
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE branches SET assigned_agent_id = ?1, updated_at = ?2
                 WHERE id = ?3 AND user_id = ?4",
                params![agent_id, now, branch_id, user_id],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            get_branch_internal(conn, user_id, branch_id)
        })
    }

    /// Delete a branch and all of its tasks in one transaction.
    pub fn delete_branch(&self, user_id: &str, branch_id: &str) -> Result<Option<DeletionReport>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            if get_branch_internal(&tx, user_id, branch_id)?.is_none() {
                return Ok(None);
            }
            let report = delete_branch_tx(&tx, user_id, branch_id)?;
            tx.commit()?;
            Ok(Some(report))
        })
    }

    /// Per-status counts and averages for a branch.
    pub fn branch_statistics(&self, user_id: &str, branch_id: &str) -> Result<Option<BranchStatistics>> {
        self.with_conn(|conn| {
            if get_branch_internal(conn, user_id, branch_id)?.is_none() {
                return Ok(None);
            }

            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*), COALESCE(SUM(progress_percentage), 0)
                 FROM tasks WHERE branch_id = ?1 GROUP BY status",
            )?;
            let rows = stmt
                .query_map(params![branch_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut by_status = BTreeMap::new();
            let mut total = 0;
            let mut progress_sum = 0;
            for (status, count, progress) in rows {
                total += count;
                progress_sum += progress;
                by_status.insert(status, count);
            }
            let completed = by_status.get(TaskStatus::Done.as_str()).copied().unwrap_or(0);
            let (completion_percentage, average_progress) = if total == 0 {
                (0.0, 0.0)
            } else {
                (
                    completed as f64 * 100.0 / total as f64,
                    progress_sum as f64 / total as f64,
                )
            };

            Ok(Some(BranchStatistics {
                branch_id: branch_id.to_string(),
                total_tasks: total,
                completed_tasks: completed,
                by_status,
                completion_percentage,
                average_progress,
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_requires_owned_project() {
        let db = Database::open_in_memory().unwrap();
        let project = db.create_project("u1", "alpha", "", None).unwrap();
        let err: ApiError = db
            .create_branch("u2", &project.id, "main", "", Priority::Medium)
            .unwrap_err()
            .into();
        assert_eq!(err.code, crate::error::ErrorCode::ProjectNotFound);
    }

    #[test]
    fn branch_names_unique_per_project() {
        let db = Database::open_in_memory().unwrap();
        let p1 = db.create_project("u1", "alpha", "", None).unwrap();
        let p2 = db.create_project("u1", "beta", "", None).unwrap();
        db.create_branch("u1", &p1.id, "main", "", Priority::Medium).unwrap();
        db.create_branch("u1", &p2.id, "main", "", Priority::Medium).unwrap();
        assert!(db.create_branch("u1", &p1.id, "main", "", Priority::Medium).is_err());
    }

    #[test]
    fn assign_and_unassign_agent() {
        let db = Database::open_in_memory().unwrap();
        let project = db.create_project("u1", "alpha", "", None).unwrap();
        let branch = db.create_branch("u1", &project.id, "main", "", Priority::High).unwrap();

        let assigned = db.set_branch_agent("u1", &branch.id, Some("agent-7")).unwrap().unwrap();
        assert_eq!(assigned.assigned_agent_id.as_deref(), Some("agent-7"));
        let cleared = db.set_branch_agent("u1", &branch.id, None).unwrap().unwrap();
        assert!(cleared.assigned_agent_id.is_none());
        assert!(db.set_branch_agent("u2", &branch.id, Some("x")).unwrap().is_none());
    }

    #[test]
    fn empty_branch_statistics() {
        let db = Database::open_in_memory().unwrap();
        let project = db.create_project("u1", "alpha", "", None).unwrap();
        let branch = db.create_branch("u1", &project.id, "main", "", Priority::Low).unwrap();
        let stats = db.branch_statistics("u1", &branch.id).unwrap().unwrap();
        assert_eq!(stats.total_tasks, 0);
        assert_eq!(stats.completion_percentage, 0.0);
    }
}
