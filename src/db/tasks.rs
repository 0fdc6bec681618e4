//! Task persistence: CRUD, assignees, labels, dependencies and selection.

use super::branches::{get_branch_internal, refresh_branch_counters};
use super::{Database, new_id, now_ms, optional, parse_column, parse_json};
use crate::error::ApiError;
use crate::types::{
    Assignee, DeletionReport, NewTask, ProgressEntry, ProgressState, Task, TaskFilter,
    TaskStatus, TaskUpdate, clamp_limit,
};
use anyhow::Result;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, Row, TransactionBehavior, params, params_from_iter};
use std::collections::{HashSet, VecDeque};

/// SQL ordering expression ranking priorities, most important first.
const PRIORITY_ORDER: &str = "CASE t.priority
    WHEN 'critical' THEN 0 WHEN 'urgent' THEN 1 WHEN 'high' THEN 2
    WHEN 'medium' THEN 3 ELSE 4 END";

pub fn parse_task_row(row: &Row) -> rusqlite::Result<Task> {
    let history_json: String = row.get("progress_history")?;
    let work_context_json: String = row.get("ai_work_context")?;

    Ok(Task {
        id: row.get("id")?,
        branch_id: row.get("branch_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        status: parse_column("status", row.get("status")?)?,
        priority: parse_column("priority", row.get("priority")?)?,
        details: row.get("details")?,
        estimated_effort: row.get("estimated_effort")?,
        due_date: row.get("due_date")?,
        progress_percentage: row.get("progress_percentage")?,
        progress_state: parse_column("progress_state", row.get("progress_state")?)?,
        progress_history: parse_json(&history_json),
        ai_system_prompt: row.get("ai_system_prompt")?,
        ai_request_prompt: row.get("ai_request_prompt")?,
        ai_work_context: parse_json(&work_context_json),
        completion_summary: row.get("completion_summary")?,
        testing_notes: row.get("testing_notes")?,
        completed_at: row.get("completed_at")?,
        assignees: Vec::new(),
        labels: Vec::new(),
        dependencies: Vec::new(),
        user_id: row.get("user_id")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

// =============================================================================
// Junction table helpers
// =============================================================================

/// Replace the assignees of a task, keeping the original assignment time of
/// assignees that stay.
fn sync_assignees(conn: &Connection, task_id: &str, assignees: &[String], now: i64) -> Result<()> {
    let wanted: HashSet<&str> = assignees.iter().map(|a| a.trim()).filter(|a| !a.is_empty()).collect();
    let existing: Vec<String> = {
        let mut stmt = conn.prepare("SELECT assignee FROM task_assignees WHERE task_id = ?1")?;
        stmt.query_map(params![task_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?
    };
    for assignee in &existing {
        if !wanted.contains(assignee.as_str()) {
            conn.execute(
                "DELETE FROM task_assignees WHERE task_id = ?1 AND assignee = ?2",
                params![task_id, assignee],
            )?;
        }
    }
    for assignee in wanted {
        conn.execute(
            "INSERT OR IGNORE INTO task_assignees (task_id, assignee, assigned_at) VALUES (?1, ?2, ?3)",
            params![task_id, assignee, now],
        )?;
    }
    Ok(())
}

fn sync_labels(conn: &Connection, task_id: &str, labels: &[String]) -> Result<()> {
    conn.execute("DELETE FROM task_labels WHERE task_id = ?1", params![task_id])?;
    for label in labels {
        let label = label.trim().to_lowercase();
        if label.is_empty() {
            continue;
        }
        conn.execute(
            "INSERT OR IGNORE INTO task_labels (task_id, label) VALUES (?1, ?2)",
            params![task_id, label],
        )?;
    }
    Ok(())
}

fn load_relations(conn: &Connection, task: &mut Task) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT assignee, role, assigned_at FROM task_assignees
         WHERE task_id = ?1 ORDER BY assigned_at, assignee",
    )?;
    task.assignees = stmt
        .query_map(params![&task.id], |row| {
            Ok(Assignee {
                assignee: row.get(0)?,
                role: row.get(1)?,
                assigned_at: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare("SELECT label FROM task_labels WHERE task_id = ?1 ORDER BY label")?;
    task.labels = stmt
        .query_map(params![&task.id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare(
        "SELECT depends_on_task_id FROM task_dependencies WHERE task_id = ?1 ORDER BY created_at",
    )?;
    task.dependencies = stmt
        .query_map(params![&task.id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(())
}

pub(crate) fn get_task_internal(conn: &Connection, user_id: &str, task_id: &str) -> Result<Option<Task>> {
    let task = optional(conn.query_row(
        "SELECT * FROM tasks WHERE id = ?1 AND user_id = ?2",
        params![task_id, user_id],
        parse_task_row,
    ))?;
    match task {
        Some(mut task) => {
            load_relations(conn, &mut task)?;
            Ok(Some(task))
        }
        None => Ok(None),
    }
}

fn task_exists(conn: &Connection, user_id: &str, task_id: &str) -> Result<bool> {
    let found: Option<i64> = optional(conn.query_row(
        "SELECT 1 FROM tasks WHERE id = ?1 AND user_id = ?2",
        params![task_id, user_id],
        |row| row.get(0),
    ))?;
    Ok(found.is_some())
}

/// Whether `depends_on` already (transitively) depends on `task_id`.
fn would_create_cycle(conn: &Connection, task_id: &str, depends_on: &str) -> Result<bool> {
    if task_id == depends_on {
        return Ok(true);
    }

    let mut stmt =
        conn.prepare("SELECT depends_on_task_id FROM task_dependencies WHERE task_id = ?1")?;
    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    queue.push_back(depends_on.to_string());

    while let Some(current) = queue.pop_front() {
        if current == task_id {
            return Ok(true);
        }
        if !visited.insert(current.clone()) {
            continue;
        }
        let next = stmt
            .query_map(params![&current], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        queue.extend(next.into_iter().filter(|id| !visited.contains(id)));
    }

    Ok(false)
}

fn count_open_subtasks(conn: &Connection, task_id: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM subtasks WHERE task_id = ?1 AND status != 'done'",
        params![task_id],
        |row| row.get(0),
    )?)
}

/// Remove a task and its satellites on an open transaction.
fn delete_task_tx(conn: &Connection, user_id: &str, task_id: &str) -> Result<DeletionReport> {
    let mut report = DeletionReport::default();
    report.subtasks = conn.execute("DELETE FROM subtasks WHERE task_id = ?1", params![task_id])?;
    report.assignees =
        conn.execute("DELETE FROM task_assignees WHERE task_id = ?1", params![task_id])?;
    report.labels = conn.execute("DELETE FROM task_labels WHERE task_id = ?1", params![task_id])?;
    report.dependencies = conn.execute(
        "DELETE FROM task_dependencies WHERE task_id = ?1 OR depends_on_task_id = ?1",
        params![task_id],
    )?;
    conn.execute(
        "DELETE FROM context_inheritance_cache
         WHERE context_id = ?1 AND context_level = 'task' AND user_id = ?2",
        params![task_id, user_id],
    )?;
    report.task_contexts = conn.execute(
        "DELETE FROM task_contexts WHERE id = ?1 AND user_id = ?2",
        params![task_id, user_id],
    )?;
    report.tasks = conn.execute(
        "DELETE FROM tasks WHERE id = ?1 AND user_id = ?2",
        params![task_id, user_id],
    )?;
    Ok(report)
}

/// Build the WHERE clause and bound values shared by list and count.
fn filter_clause(user_id: &str, filter: &TaskFilter) -> (String, Vec<SqlValue>) {
    let mut clauses = vec!["t.user_id = ?".to_string()];
    let mut values = vec![SqlValue::Text(user_id.to_string())];

    if let Some(ref branch_id) = filter.branch_id {
        clauses.push("t.branch_id = ?".to_string());
        values.push(SqlValue::Text(branch_id.clone()));
    }
    if let Some(ref project_id) = filter.project_id {
        clauses.push("t.branch_id IN (SELECT id FROM branches WHERE project_id = ?)".to_string());
        values.push(SqlValue::Text(project_id.clone()));
    }
    if let Some(status) = filter.status {
        clauses.push("t.status = ?".to_string());
        values.push(SqlValue::Text(status.as_str().to_string()));
    }
    if let Some(priority) = filter.priority {
        clauses.push("t.priority = ?".to_string());
        values.push(SqlValue::Text(priority.as_str().to_string()));
    }
    if let Some(ref assignee) = filter.assignee {
        clauses.push(
            "EXISTS (SELECT 1 FROM task_assignees a WHERE a.task_id = t.id AND a.assignee = ?)"
                .to_string(),
        );
        values.push(SqlValue::Text(assignee.clone()));
    }
    if let Some(ref label) = filter.label {
        clauses.push(
            "EXISTS (SELECT 1 FROM task_labels l WHERE l.task_id = t.id AND l.label = ?)".to_string(),
        );
        values.push(SqlValue::Text(label.trim().to_lowercase()));
    }

    (clauses.join(" AND "), values)
}

impl Database {
    /// Create a task with its assignees, labels and dependencies.
    pub fn create_task(&self, user_id: &str, input: &NewTask) -> Result<Task> {
        let now = now_ms();
        let task_id = new_id();
        let status = input.status.unwrap_or_default();
        let priority = input.priority.unwrap_or_default();
        let work_context = input
            .ai_work_context
            .clone()
            .unwrap_or_else(|| serde_json::json!({}));

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            if get_branch_internal(&tx, user_id, &input.branch_id)?.is_none() {
                return Err(ApiError::branch_not_found(&input.branch_id).into());
            }
            for dep in &input.dependencies {
                if !task_exists(&tx, user_id, dep)? {
                    return Err(ApiError::task_not_found(dep).into());
                }
            }

            tx.execute(
                "INSERT INTO tasks (id, branch_id, title, description, status, priority, details,
                     estimated_effort, due_date, progress_percentage, progress_state, progress_history,
                     ai_system_prompt, ai_request_prompt, ai_work_context, completed_at,
                     user_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, '[]', ?12, ?13, ?14, ?15, ?16, ?17, ?17)",
                params![
                    &task_id,
                    &input.branch_id,
                    input.title.trim(),
                    input.description.as_deref().unwrap_or(""),
                    status.as_str(),
                    priority.as_str(),
                    input.details.as_deref().unwrap_or(""),
                    &input.estimated_effort,
                    &input.due_date,
                    if status == TaskStatus::Done { 100 } else { 0 },
                    if status == TaskStatus::Done {
                        ProgressState::Complete.as_str()
                    } else {
                        ProgressState::Initial.as_str()
                    },
                    input.ai_system_prompt.as_deref().unwrap_or(""),
                    input.ai_request_prompt.as_deref().unwrap_or(""),
                    work_context.to_string(),
                    (status == TaskStatus::Done).then_some(now),
                    user_id,
                    now,
                ],
            )?;

            sync_assignees(&tx, &task_id, &input.assignees, now)?;
            sync_labels(&tx, &task_id, &input.labels)?;
            for dep in &input.dependencies {
                tx.execute(
                    "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_task_id, created_at)
                     VALUES (?1, ?2, ?3)",
                    params![&task_id, dep, now],
                )?;
            }
            refresh_branch_counters(&tx, &input.branch_id)?;

            let task = get_task_internal(&tx, user_id, &task_id)?
                .ok_or_else(|| ApiError::task_not_found(&task_id))?;
            tx.commit()?;
            Ok(task)
        })
    }

    pub fn get_task(&self, user_id: &str, task_id: &str) -> Result<Option<Task>> {
        self.with_conn(|conn| get_task_internal(conn, user_id, task_id))
    }

    /// List tasks matching the filter. Returns the page and the total match count.
    pub fn list_tasks(&self, user_id: &str, filter: &TaskFilter) -> Result<(Vec<Task>, i64)> {
        let (where_clause, values) = filter_clause(user_id, filter);
        let limit = clamp_limit(filter.limit);
        let offset = filter.offset.unwrap_or(0).max(0);

        self.with_conn(|conn| {
            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM tasks t WHERE {}", where_clause),
                params_from_iter(values.iter()),
                |row| row.get(0),
            )?;

            let sql = format!(
                "SELECT t.* FROM tasks t WHERE {}
                 ORDER BY {}, t.created_at ASC, t.id ASC
                 LIMIT ? OFFSET ?",
                where_clause, PRIORITY_ORDER
            );
            let mut paged = values.clone();
            paged.push(SqlValue::Integer(limit));
            paged.push(SqlValue::Integer(offset));

            let mut stmt = conn.prepare(&sql)?;
            let mut tasks = stmt
                .query_map(params_from_iter(paged.iter()), parse_task_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for task in &mut tasks {
                load_relations(conn, task)?;
            }

            Ok((tasks, total))
        })
    }

    /// Apply a partial update. Entering `done` is gated on the subtasks like
    /// [`Database::complete_task`] and records the same 100% progress entry.
    /// Leaving `done` clears `completed_at`.
    pub fn update_task(&self, user_id: &str, task_id: &str, update: &TaskUpdate) -> Result<Option<Task>> {
        let now = now_ms();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let Some(mut task) = get_task_internal(&tx, user_id, task_id)? else {
                return Ok(None);
            };

            if let Some(ref title) = update.title {
                task.title = title.trim().to_string();
            }
            if let Some(ref description) = update.description {
                task.description = description.clone();
            }
            if let Some(priority) = update.priority {
                task.priority = priority;
            }
            if let Some(ref details) = update.details {
                task.details = details.clone();
            }
            if let Some(ref effort) = update.estimated_effort {
                task.estimated_effort = Some(effort.clone());
            }
            if let Some(ref due) = update.due_date {
                task.due_date = Some(due.clone());
            }
            if let Some(ref prompt) = update.ai_system_prompt {
                task.ai_system_prompt = prompt.clone();
            }
            if let Some(ref prompt) = update.ai_request_prompt {
                task.ai_request_prompt = prompt.clone();
            }
            if let Some(ref context) = update.ai_work_context {
                task.ai_work_context = context.clone();
            }
            if let Some(status) = update.status
                && status != task.status
            {
                if status == TaskStatus::Done {
                    let open = count_open_subtasks(&tx, task_id)?;
                    if open > 0 {
                        return Err(ApiError::invalid_state(format!(
                            "Task {} has {} incomplete subtask(s)",
                            task_id, open
                        ))
                        .into());
                    }
                    task.completed_at = Some(now);
                    task.progress_percentage = 100;
                    task.progress_state = ProgressState::Complete;
                    task.progress_history.push(ProgressEntry {
                        percentage: 100,
                        state: ProgressState::Complete,
                        notes: None,
                        recorded_at: now,
                    });
                } else if task.status == TaskStatus::Done {
                    task.completed_at = None;
                }
                task.status = status;
            }

            tx.execute(
                "UPDATE tasks SET title = ?1, description = ?2, status = ?3, priority = ?4, details = ?5,
                     estimated_effort = ?6, due_date = ?7, ai_system_prompt = ?8, ai_request_prompt = ?9,
                     ai_work_context = ?10, completed_at = ?11, updated_at = ?12, progress_percentage = ?13,
                     progress_state = ?14, progress_history = ?15
                 WHERE id = ?16 AND user_id = ?17",
                params![
                    &task.title,
                    &task.description,
                    task.status.as_str(),
                    task.priority.as_str(),
                    &task.details,
                    &task.estimated_effort,
                    &task.due_date,
                    &task.ai_system_prompt,
                    &task.ai_request_prompt,
                    task.ai_work_context.to_string(),
                    task.completed_at,
                    now,
                    task.progress_percentage,
                    task.progress_state.as_str(),
                    serde_json::to_string(&task.progress_history)?,
                    task_id,
                    user_id,
                ],
            )?;
            if let Some(ref assignees) = update.assignees {
                sync_assignees(&tx, task_id, assignees, now)?;
            }
            if let Some(ref labels) = update.labels {
                sync_labels(&tx, task_id, labels)?;
            }
            refresh_branch_counters(&tx, &task.branch_id)?;

            let task = get_task_internal(&tx, user_id, task_id)?;
            tx.commit()?;
            Ok(task)
        })
    }

    /// Delete a task with its subtasks, satellites and context.
    pub fn delete_task(&self, user_id: &str, task_id: &str) -> Result<Option<DeletionReport>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let Some(task) = get_task_internal(&tx, user_id, task_id)? else {
                return Ok(None);
            };
            let report = delete_task_tx(&tx, user_id, task_id)?;
            refresh_branch_counters(&tx, &task.branch_id)?;
            tx.commit()?;
            Ok(Some(report))
        })
    }

    /// Mark a task done. Fails with `InvalidState` while subtasks are open.
    pub fn complete_task(
        &self,
        user_id: &str,
        task_id: &str,
        completion_summary: Option<&str>,
        testing_notes: Option<&str>,
    ) -> Result<Option<Task>> {
        let now = now_ms();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let Some(mut task) = get_task_internal(&tx, user_id, task_id)? else {
                return Ok(None);
            };
            if task.status == TaskStatus::Done {
                return Err(ApiError::invalid_state(format!("Task {} is already done", task_id)).into());
            }
            let open = count_open_subtasks(&tx, task_id)?;
            if open > 0 {
                return Err(ApiError::invalid_state(format!(
                    "Task {} has {} incomplete subtask(s)",
                    task_id, open
                ))
                .into());
            }

            task.progress_history.push(ProgressEntry {
                percentage: 100,
                state: ProgressState::Complete,
                notes: completion_summary.map(str::to_string),
                recorded_at: now,
            });
            tx.execute(
                "UPDATE tasks SET status = 'done', progress_percentage = 100, progress_state = 'complete',
                     progress_history = ?1, completion_summary = ?2, testing_notes = ?3,
                     completed_at = ?4, updated_at = ?4
                 WHERE id = ?5 AND user_id = ?6",
                params![
                    serde_json::to_string(&task.progress_history)?,
                    completion_summary,
                    testing_notes,
                    now,
                    task_id,
                    user_id,
                ],
            )?;
            refresh_branch_counters(&tx, &task.branch_id)?;

            let task = get_task_internal(&tx, user_id, task_id)?;
            tx.commit()?;
            Ok(task)
        })
    }

    /// Persist progress fields computed by the progress service.
    pub fn save_task_progress(
        &self,
        user_id: &str,
        task_id: &str,
        status: TaskStatus,
        percentage: i32,
        state: ProgressState,
        history: &[ProgressEntry],
    ) -> Result<Option<Task>> {
        let now = now_ms();
        let history_json = serde_json::to_string(history)?;
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE tasks SET status = ?1, progress_percentage = ?2, progress_state = ?3,
                     progress_history = ?4, updated_at = ?5
                 WHERE id = ?6 AND user_id = ?7",
                params![status.as_str(), percentage, state.as_str(), history_json, now, task_id, user_id],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            let task = get_task_internal(&tx, user_id, task_id)?;
            if let Some(ref task) = task {
                refresh_branch_counters(&tx, &task.branch_id)?;
            }
            tx.commit()?;
            Ok(task)
        })
    }

    /// Record that `task_id` depends on `depends_on`. Rejects cycles.
    pub fn add_task_dependency(&self, user_id: &str, task_id: &str, depends_on: &str) -> Result<()> {
        let now = now_ms();
        self.with_conn_mut(|conn| {
            // Take the write lock before the cycle walk so concurrent inserts serialize
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if !task_exists(&tx, user_id, task_id)? {
                return Err(ApiError::task_not_found(task_id).into());
            }
            if !task_exists(&tx, user_id, depends_on)? {
                return Err(ApiError::task_not_found(depends_on).into());
            }
            if would_create_cycle(&tx, task_id, depends_on)? {
                return Err(ApiError::dependency_cycle(task_id, depends_on).into());
            }
            tx.execute(
                "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_task_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![task_id, depends_on, now],
            )?;
            tx.execute(
                "UPDATE tasks SET updated_at = ?1 WHERE id = ?2",
                params![now, task_id],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Remove a dependency. Returns whether one existed.
    pub fn remove_task_dependency(&self, user_id: &str, task_id: &str, depends_on: &str) -> Result<bool> {
        self.with_conn(|conn| {
            if !task_exists(conn, user_id, task_id)? {
                return Err(ApiError::task_not_found(task_id).into());
            }
            let removed = conn.execute(
                "DELETE FROM task_dependencies WHERE task_id = ?1 AND depends_on_task_id = ?2",
                params![task_id, depends_on],
            )?;
            Ok(removed > 0)
        })
    }

    /// Highest-priority `todo`/`in_progress` task whose dependencies are all done.
    ///
    /// Work already in progress wins over new work of the same priority.
    pub fn next_task(
        &self,
        user_id: &str,
        branch_id: Option<&str>,
        project_id: Option<&str>,
    ) -> Result<Option<Task>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT t.* FROM tasks t
                 WHERE t.user_id = ?1
                   AND t.status IN ('todo', 'in_progress')
                   AND (?2 IS NULL OR t.branch_id = ?2)
                   AND (?3 IS NULL OR t.branch_id IN (SELECT id FROM branches WHERE project_id = ?3))
                   AND NOT EXISTS (
                       SELECT 1 FROM task_dependencies d
                       JOIN tasks blocker ON blocker.id = d.depends_on_task_id
                       WHERE d.task_id = t.id AND blocker.status != 'done'
                   )
                 ORDER BY {}, CASE t.status WHEN 'in_progress' THEN 0 ELSE 1 END, t.created_at ASC
                 LIMIT 1",
                PRIORITY_ORDER
            );
            let task = optional(conn.query_row(&sql, params![user_id, branch_id, project_id], parse_task_row))?;
            match task {
                Some(mut task) => {
                    load_relations(conn, &mut task)?;
                    Ok(Some(task))
                }
                None => Ok(None),
            }
        })
    }

    /// Ids of the unfinished tasks `task_id` waits on.
    pub fn open_blockers(&self, user_id: &str, task_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT d.depends_on_task_id FROM task_dependencies d
                 JOIN tasks blocker ON blocker.id = d.depends_on_task_id
                 WHERE d.task_id = ?1 AND blocker.user_id = ?2 AND blocker.status != 'done'",
            )?;
            let ids = stmt
                .query_map(params![task_id, user_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;

    fn setup() -> (Database, String) {
        let db = Database::open_in_memory().unwrap();
        let project = db.create_project("u1", "alpha", "", None).unwrap();
        let branch = db
            .create_branch("u1", &project.id, "main", "", Priority::Medium)
            .unwrap();
        (db, branch.id)
    }

    fn new_task(branch_id: &str, title: &str) -> NewTask {
        NewTask {
            branch_id: branch_id.to_string(),
            title: title.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn create_keeps_branch_counters_exact() {
        let (db, branch_id) = setup();
        db.create_task("u1", &new_task(&branch_id, "a")).unwrap();
        let b = db.create_task("u1", &new_task(&branch_id, "b")).unwrap();
        db.update_task(
            "u1",
            &b.id,
            &TaskUpdate {
                status: Some(TaskStatus::Done),
                ..Default::default()
            },
        )
        .unwrap();

        let branch = db.get_branch("u1", &branch_id).unwrap().unwrap();
        assert_eq!(branch.task_count, 2);
        assert_eq!(branch.completed_task_count, 1);

        db.delete_task("u1", &b.id).unwrap().unwrap();
        let branch = db.get_branch("u1", &branch_id).unwrap().unwrap();
        assert_eq!(branch.task_count, 1);
        assert_eq!(branch.completed_task_count, 0);
    }

    #[test]
    fn relations_are_loaded() {
        let (db, branch_id) = setup();
        let dep = db.create_task("u1", &new_task(&branch_id, "dep")).unwrap();
        let mut input = new_task(&branch_id, "main");
        input.assignees = vec!["alice".into(), "bob".into()];
        input.labels = vec!["Backend".into(), " api ".into()];
        input.dependencies = vec![dep.id.clone()];
        let task = db.create_task("u1", &input).unwrap();

        assert_eq!(task.assignees.len(), 2);
        assert_eq!(task.labels, vec!["api".to_string(), "backend".to_string()]);
        assert_eq!(task.dependencies, vec![dep.id]);
    }

    #[test]
    fn dependency_cycles_are_rejected() {
        let (db, branch_id) = setup();
        let a = db.create_task("u1", &new_task(&branch_id, "a")).unwrap();
        let b = db.create_task("u1", &new_task(&branch_id, "b")).unwrap();
        let c = db.create_task("u1", &new_task(&branch_id, "c")).unwrap();

        db.add_task_dependency("u1", &a.id, &b.id).unwrap();
        db.add_task_dependency("u1", &b.id, &c.id).unwrap();

        let err: ApiError = db.add_task_dependency("u1", &c.id, &a.id).unwrap_err().into();
        assert_eq!(err.code, crate::error::ErrorCode::DependencyCycle);
        let err: ApiError = db.add_task_dependency("u1", &a.id, &a.id).unwrap_err().into();
        assert_eq!(err.code, crate::error::ErrorCode::DependencyCycle);
    }

    #[test]
    fn list_filters_and_paginates() {
        let (db, branch_id) = setup();
        for i in 0..5 {
            let mut input = new_task(&branch_id, &format!("t{}", i));
            if i % 2 == 0 {
                input.labels = vec!["even".into()];
            }
            db.create_task("u1", &input).unwrap();
        }

        let (page, total) = db
            .list_tasks(
                "u1",
                &TaskFilter {
                    label: Some("even".into()),
                    limit: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 2);

        let (other, total) = db.list_tasks("u2", &TaskFilter::default()).unwrap();
        assert!(other.is_empty());
        assert_eq!(total, 0);
    }

    #[test]
    fn next_task_skips_blocked_and_prefers_priority() {
        let (db, branch_id) = setup();
        let blocker = db.create_task("u1", &new_task(&branch_id, "blocker")).unwrap();
        let mut urgent = new_task(&branch_id, "urgent but blocked");
        urgent.priority = Some(Priority::Critical);
        urgent.dependencies = vec![blocker.id.clone()];
        db.create_task("u1", &urgent).unwrap();
        let mut high = new_task(&branch_id, "high");
        high.priority = Some(Priority::High);
        let high = db.create_task("u1", &high).unwrap();

        let next = db.next_task("u1", Some(&branch_id), None).unwrap().unwrap();
        assert_eq!(next.id, high.id);
    }

    #[test]
    fn complete_requires_done_subtasks() {
        let (db, branch_id) = setup();
        let task = db.create_task("u1", &new_task(&branch_id, "parent")).unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO subtasks (id, task_id, title, user_id, created_at, updated_at)
                 VALUES ('s1', ?1, 'child', 'u1', 0, 0)",
                params![&task.id],
            )?;
            Ok(())
        })
        .unwrap();

        let err: ApiError = db
            .complete_task("u1", &task.id, Some("done"), None)
            .unwrap_err()
            .into();
        assert_eq!(err.code, crate::error::ErrorCode::InvalidState);
    }
}
