//! `manage_task` tool.

use super::{from_args, get_i64, get_string, make_tool, require_string, to_json, unknown_action};
use crate::error::{ApiError, ApiResult};
use crate::services::Services;
use crate::types::{NewTask, Priority, TaskFilter, TaskStatus, TaskUpdate};
use rmcp::model::Tool;
use serde_json::{Value, json};

const ACTIONS: &[&str] = &[
    "create",
    "get",
    "list",
    "update",
    "delete",
    "complete",
    "next",
    "update_progress",
    "add_dependency",
    "remove_dependency",
];

pub fn tool() -> Tool {
    make_tool(
        "manage_task",
        "Manage tasks: CRUD, completion, progress, dependencies, and picking the next actionable task.",
        ACTIONS,
        json!({
            "task_id": { "type": "string" },
            "branch_id": { "type": "string", "description": "Owning branch (create) or list filter" },
            "project_id": { "type": "string", "description": "List/next filter" },
            "title": { "type": "string" },
            "description": { "type": "string" },
            "status": { "type": "string", "enum": TaskStatus::names() },
            "priority": { "type": "string", "enum": Priority::names() },
            "details": { "type": "string" },
            "estimated_effort": { "type": "string" },
            "due_date": { "type": "string" },
            "assignees": { "type": "array", "items": { "type": "string" } },
            "labels": { "type": "array", "items": { "type": "string" } },
            "dependencies": { "type": "array", "items": { "type": "string" } },
            "assignee": { "type": "string", "description": "List filter" },
            "label": { "type": "string", "description": "List filter" },
            "completion_summary": { "type": "string" },
            "testing_notes": { "type": "string" },
            "percentage": { "type": "integer", "minimum": 0, "maximum": 100 },
            "notes": { "type": "string" },
            "depends_on": { "type": "string", "description": "Dependency task ID" },
            "limit": { "type": "integer" },
            "offset": { "type": "integer" }
        }),
        vec![],
    )
}

pub fn manage(services: &Services, user_id: &str, args: &Value) -> ApiResult<Value> {
    let action = require_string(args, "action")?;
    let tasks = &services.tasks;
    match action.as_str() {
        "create" => {
            let input: NewTask = from_args(args)?;
            to_json(tasks.create(user_id, input)?)
        }
        "get" => to_json(tasks.get(user_id, &require_string(args, "task_id")?)?),
        "list" => {
            let filter: TaskFilter = from_args(args)?;
            to_json(tasks.list(user_id, &filter)?)
        }
        "update" => {
            let task_id = require_string(args, "task_id")?;
            let update: TaskUpdate = from_args(args)?;
            to_json(tasks.update(user_id, &task_id, &update)?)
        }
        "delete" => to_json(tasks.delete(user_id, &require_string(args, "task_id")?)?),
        "complete" => {
            let task_id = require_string(args, "task_id")?;
            let summary = get_string(args, "completion_summary");
            let notes = get_string(args, "testing_notes");
            to_json(tasks.complete(user_id, &task_id, summary.as_deref(), notes.as_deref())?)
        }
        "next" => {
            let branch_id = get_string(args, "branch_id");
            let project_id = get_string(args, "project_id");
            let task = tasks.next(user_id, branch_id.as_deref(), project_id.as_deref())?;
            Ok(json!({ "task": task }))
        }
        "update_progress" => {
            let task_id = require_string(args, "task_id")?;
            let percentage = get_i64(args, "percentage").ok_or_else(|| ApiError::missing_field("percentage"))?;
            let percentage = i32::try_from(percentage.clamp(0, 100)).unwrap_or(0);
            let notes = get_string(args, "notes");
            to_json(
                services
                    .progress
                    .update_progress(user_id, &task_id, percentage, notes.as_deref())?,
            )
        }
        "add_dependency" => {
            let task_id = require_string(args, "task_id")?;
            let depends_on = require_string(args, "depends_on")?;
            to_json(tasks.add_dependency(user_id, &task_id, &depends_on)?)
        }
        "remove_dependency" => {
            let task_id = require_string(args, "task_id")?;
            let depends_on = require_string(args, "depends_on")?;
            to_json(tasks.remove_dependency(user_id, &task_id, &depends_on)?)
        }
        other => Err(unknown_action("manage_task", other)),
    }
}
