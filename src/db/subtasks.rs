//! Subtask persistence.

use super::branches::refresh_branch_counters;
use super::tasks::get_task_internal;
use super::{Database, new_id, now_ms, optional, parse_column, parse_json};
use crate::error::ApiError;
use crate::types::{NewSubtask, Subtask, SubtaskUpdate, TaskStatus};
use anyhow::Result;
use rusqlite::{Connection, Row, params};

fn parse_subtask_row(row: &Row) -> rusqlite::Result<Subtask> {
    let assignees: String = row.get("assignees")?;
    Ok(Subtask {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        status: parse_column("status", row.get("status")?)?,
        priority: parse_column("priority", row.get("priority")?)?,
        assignees: parse_json(&assignees),
        progress_percentage: row.get("progress_percentage")?,
        progress_notes: row.get("progress_notes")?,
        completion_summary: row.get("completion_summary")?,
        completed_at: row.get("completed_at")?,
        user_id: row.get("user_id")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn get_subtask_internal(
    conn: &Connection,
    user_id: &str,
    task_id: &str,
    subtask_id: &str,
) -> Result<Option<Subtask>> {
    optional(conn.query_row(
        "SELECT * FROM subtasks WHERE id = ?1 AND task_id = ?2 AND user_id = ?3",
        params![subtask_id, task_id, user_id],
        parse_subtask_row,
    ))
}

fn write_subtask(conn: &Connection, subtask: &Subtask) -> Result<()> {
    conn.execute(
        "UPDATE subtasks SET title = ?1, description = ?2, status = ?3, priority = ?4, assignees = ?5,
             progress_percentage = ?6, progress_notes = ?7, completion_summary = ?8,
             completed_at = ?9, updated_at = ?10
         WHERE id = ?11 AND user_id = ?12",
        params![
            &subtask.title,
            &subtask.description,
            subtask.status.as_str(),
            subtask.priority.as_str(),
            serde_json::to_string(&subtask.assignees)?,
            subtask.progress_percentage,
            &subtask.progress_notes,
            &subtask.completion_summary,
            subtask.completed_at,
            subtask.updated_at,
            &subtask.id,
            &subtask.user_id,
        ],
    )?;
    Ok(())
}

impl Database {
    /// Create a subtask under one of the user's tasks.
    pub fn create_subtask(&self, user_id: &str, task_id: &str, input: &NewSubtask) -> Result<Subtask> {
        let now = now_ms();
        let subtask = Subtask {
            id: new_id(),
            task_id: task_id.to_string(),
            title: input.title.trim().to_string(),
            description: input.description.clone().unwrap_or_default(),
            status: TaskStatus::Todo,
            priority: input.priority.unwrap_or_default(),
            assignees: input.assignees.clone(),
            progress_percentage: 0,
            progress_notes: String::new(),
            completion_summary: None,
            completed_at: None,
            user_id: user_id.to_string(),
            created_at: now,
            updated_at: now,
        };

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let Some(task) = get_task_internal(&tx, user_id, task_id)? else {
                return Err(ApiError::task_not_found(task_id).into());
            };
            // New work reopens a finished task
            if task.status == TaskStatus::Done {
                tx.execute(
                    "UPDATE tasks SET status = 'in_progress', completed_at = NULL, updated_at = ?1
                     WHERE id = ?2 AND user_id = ?3",
                    params![now, task_id, user_id],
                )?;
                refresh_branch_counters(&tx, &task.branch_id)?;
            }
            tx.execute(
                "INSERT INTO subtasks (id, task_id, title, description, status, priority, assignees,
                     progress_percentage, progress_notes, user_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, '', ?8, ?9, ?9)",
                params![
                    &subtask.id,
                    task_id,
                    &subtask.title,
                    &subtask.description,
                    subtask.status.as_str(),
                    subtask.priority.as_str(),
                    serde_json::to_string(&subtask.assignees)?,
                    user_id,
                    now,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })?;

        Ok(subtask)
    }

    pub fn get_subtask(&self, user_id: &str, task_id: &str, subtask_id: &str) -> Result<Option<Subtask>> {
        self.with_conn(|conn| get_subtask_internal(conn, user_id, task_id, subtask_id))
    }

    /// Subtasks of a task in creation order. `None` when the task is unknown.
    pub fn list_subtasks(&self, user_id: &str, task_id: &str) -> Result<Option<Vec<Subtask>>> {
        self.with_conn(|conn| {
            if get_task_internal(conn, user_id, task_id)?.is_none() {
                return Ok(None);
            }
            let mut stmt = conn.prepare(
                "SELECT * FROM subtasks WHERE task_id = ?1 AND user_id = ?2
                 ORDER BY created_at ASC, id ASC",
            )?;
            let subtasks = stmt
                .query_map(params![task_id, user_id], parse_subtask_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(Some(subtasks))
        })
    }

    /// Apply a partial update. Status `done` forces 100% progress.
    pub fn update_subtask(
        &self,
        user_id: &str,
        task_id: &str,
        subtask_id: &str,
        update: &SubtaskUpdate,
    ) -> Result<Option<Subtask>> {
        let now = now_ms();
        self.with_conn(|conn| {
            let Some(mut subtask) = get_subtask_internal(conn, user_id, task_id, subtask_id)? else {
                return Ok(None);
            };

            if let Some(ref title) = update.title {
                subtask.title = title.trim().to_string();
            }
            if let Some(ref description) = update.description {
                subtask.description = description.clone();
            }
            if let Some(priority) = update.priority {
                subtask.priority = priority;
            }
            if let Some(ref assignees) = update.assignees {
                subtask.assignees = assignees.clone();
            }
            if let Some(percentage) = update.progress_percentage {
                subtask.progress_percentage = percentage.clamp(0, 100);
                if subtask.status == TaskStatus::Todo && subtask.progress_percentage > 0 {
                    subtask.status = TaskStatus::InProgress;
                }
            }
            if let Some(ref notes) = update.progress_notes {
                subtask.progress_notes = notes.clone();
            }
            if let Some(status) = update.status {
                if status == TaskStatus::Done && subtask.status != TaskStatus::Done {
                    subtask.completed_at = Some(now);
                } else if status != TaskStatus::Done {
                    subtask.completed_at = None;
                }
                subtask.status = status;
            }
            if subtask.status == TaskStatus::Done {
                subtask.progress_percentage = 100;
            }
            subtask.updated_at = now;

            write_subtask(conn, &subtask)?;
            Ok(Some(subtask))
        })
    }

    /// Mark a subtask done with an optional summary.
    pub fn complete_subtask(
        &self,
        user_id: &str,
        task_id: &str,
        subtask_id: &str,
        completion_summary: Option<&str>,
    ) -> Result<Option<Subtask>> {
        let now = now_ms();
        self.with_conn(|conn| {
            let Some(mut subtask) = get_subtask_internal(conn, user_id, task_id, subtask_id)? else {
                return Ok(None);
            };
            subtask.status = TaskStatus::Done;
            subtask.progress_percentage = 100;
            subtask.completion_summary = completion_summary.map(str::to_string);
            subtask.completed_at = Some(now);
            subtask.updated_at = now;
            write_subtask(conn, &subtask)?;
            Ok(Some(subtask))
        })
    }

    pub fn delete_subtask(&self, user_id: &str, task_id: &str, subtask_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM subtasks WHERE id = ?1 AND task_id = ?2 AND user_id = ?3",
                params![subtask_id, task_id, user_id],
            )?;
            Ok(removed > 0)
        })
    }

    /// `(done, total, average progress)` over a task's subtasks.
    pub fn subtask_progress(&self, user_id: &str, task_id: &str) -> Result<(i64, i64, f64)> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COALESCE(SUM(status = 'done'), 0), COUNT(*),
                        COALESCE(AVG(CASE WHEN status = 'done' THEN 100 ELSE progress_percentage END), 0.0)
                 FROM subtasks WHERE task_id = ?1 AND user_id = ?2",
                params![task_id, user_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?)
        })
    }
}
