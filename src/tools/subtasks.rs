//! `manage_subtask` tool.

use super::{from_args, get_string, make_tool, require_string, to_json, unknown_action};
use crate::error::ApiResult;
use crate::services::Services;
use crate::types::{NewSubtask, Priority, SubtaskUpdate, TaskStatus};
use rmcp::model::Tool;
use serde_json::{Value, json};

const ACTIONS: &[&str] = &["create", "get", "list", "update", "complete", "delete"];

pub fn tool() -> Tool {
    make_tool(
        "manage_subtask",
        "Manage subtasks of a task. Every change recalculates the parent task's progress.",
        ACTIONS,
        json!({
            "task_id": { "type": "string", "description": "Parent task ID" },
            "subtask_id": { "type": "string" },
            "title": { "type": "string" },
            "description": { "type": "string" },
            "status": { "type": "string", "enum": TaskStatus::names() },
            "priority": { "type": "string", "enum": Priority::names() },
            "assignees": { "type": "array", "items": { "type": "string" } },
            "progress_percentage": { "type": "integer", "minimum": 0, "maximum": 100 },
            "progress_notes": { "type": "string" },
            "completion_summary": { "type": "string" }
        }),
        vec!["task_id"],
    )
}

pub fn manage(services: &Services, user_id: &str, args: &Value) -> ApiResult<Value> {
    let action = require_string(args, "action")?;
    let task_id = require_string(args, "task_id")?;
    let subtasks = &services.subtasks;
    match action.as_str() {
        "create" => {
            let input: NewSubtask = from_args(args)?;
            to_json(subtasks.create(user_id, &task_id, input)?)
        }
        "get" => to_json(subtasks.get(user_id, &task_id, &require_string(args, "subtask_id")?)?),
        "list" => {
            let list = subtasks.list(user_id, &task_id)?;
            Ok(json!({ "subtasks": list, "count": list.len() }))
        }
        "update" => {
            let subtask_id = require_string(args, "subtask_id")?;
            let update: SubtaskUpdate = from_args(args)?;
            to_json(subtasks.update(user_id, &task_id, &subtask_id, &update)?)
        }
        "complete" => {
            let subtask_id = require_string(args, "subtask_id")?;
            let summary = get_string(args, "completion_summary");
            to_json(subtasks.complete(user_id, &task_id, &subtask_id, summary.as_deref())?)
        }
        "delete" => {
            let subtask_id = require_string(args, "subtask_id")?;
            subtasks.delete(user_id, &task_id, &subtask_id)?;
            Ok(json!({ "deleted": subtask_id }))
        }
        other => Err(unknown_action("manage_subtask", other)),
    }
}
