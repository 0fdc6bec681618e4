//! Aggregation queries for summaries.

use super::Database;
use super::projects::get_project_internal;
use crate::types::ProjectSummary;
use anyhow::Result;
use rusqlite::params;
use serde::Serialize;

/// Row counts of one user's data.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UserOverview {
    pub projects: i64,
    pub branches: i64,
    pub tasks: i64,
    pub open_tasks: i64,
    pub subtasks: i64,
    pub contexts: i64,
}

impl Database {
    /// Project with its branch/task counters rolled up.
    pub fn project_summary(&self, user_id: &str, project_id: &str) -> Result<Option<ProjectSummary>> {
        self.with_conn(|conn| {
            let Some(project) = get_project_internal(conn, user_id, project_id)? else {
                return Ok(None);
            };
            let (branch_count, task_count, completed): (i64, i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(task_count), 0), COALESCE(SUM(completed_task_count), 0)
                 FROM branches WHERE project_id = ?1 AND user_id = ?2",
                params![project_id, user_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            let completion_percentage = if task_count == 0 {
                0.0
            } else {
                completed as f64 * 100.0 / task_count as f64
            };

            Ok(Some(ProjectSummary {
                project,
                branch_count,
                task_count,
                completed_task_count: completed,
                completion_percentage,
            }))
        })
    }

    pub fn user_overview(&self, user_id: &str) -> Result<UserOverview> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT
                    (SELECT COUNT(*) FROM projects WHERE user_id = ?1),
                    (SELECT COUNT(*) FROM branches WHERE user_id = ?1),
                    (SELECT COUNT(*) FROM tasks WHERE user_id = ?1),
                    (SELECT COUNT(*) FROM tasks WHERE user_id = ?1 AND status NOT IN ('done', 'cancelled')),
                    (SELECT COUNT(*) FROM subtasks WHERE user_id = ?1),
                    (SELECT COUNT(*) FROM global_contexts WHERE user_id = ?1)
                      + (SELECT COUNT(*) FROM project_contexts WHERE user_id = ?1)
                      + (SELECT COUNT(*) FROM branch_contexts WHERE user_id = ?1)
                      + (SELECT COUNT(*) FROM task_contexts WHERE user_id = ?1)",
                params![user_id],
                |row| {
                    Ok(UserOverview {
                        projects: row.get(0)?,
                        branches: row.get(1)?,
                        tasks: row.get(2)?,
                        open_tasks: row.get(3)?,
                        subtasks: row.get(4)?,
                        contexts: row.get(5)?,
                    })
                },
            )?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewTask, Priority, TaskStatus};

    #[test]
    fn summary_rolls_up_branches() {
        let db = Database::open_in_memory().unwrap();
        let project = db.create_project("u1", "alpha", "", None).unwrap();
        let main = db.create_branch("u1", &project.id, "main", "", Priority::Medium).unwrap();
        let dev = db.create_branch("u1", &project.id, "dev", "", Priority::Medium).unwrap();
        for (branch, status) in [(&main, TaskStatus::Done), (&dev, TaskStatus::Todo)] {
            db.create_task(
                "u1",
                &NewTask {
                    branch_id: branch.id.clone(),
                    title: "t".into(),
                    status: Some(status),
                    ..Default::default()
                },
            )
            .unwrap();
        }

        let summary = db.project_summary("u1", &project.id).unwrap().unwrap();
        assert_eq!(summary.branch_count, 2);
        assert_eq!(summary.task_count, 2);
        assert_eq!(summary.completed_task_count, 1);
        assert!((summary.completion_percentage - 50.0).abs() < f64::EPSILON);

        let overview = db.user_overview("u1").unwrap();
        assert_eq!(overview.open_tasks, 1);
        assert!(db.project_summary("u2", &project.id).unwrap().is_none());
    }
}
