//! `manage_branch` tool.

use super::{from_args, get_i64, get_parsed, get_string, make_tool, require_string, to_json, unknown_action};
use crate::error::ApiResult;
use crate::services::Services;
use crate::types::{BranchUpdate, Priority, TaskStatus, clamp_limit};
use rmcp::model::Tool;
use serde_json::{Value, json};

const ACTIONS: &[&str] = &[
    "create",
    "get",
    "list",
    "update",
    "delete",
    "assign_agent",
    "unassign_agent",
    "statistics",
];

pub fn tool() -> Tool {
    make_tool(
        "manage_branch",
        "Manage branches (work streams) inside a project, including agent assignment and statistics.",
        ACTIONS,
        json!({
            "branch_id": { "type": "string" },
            "project_id": { "type": "string", "description": "Owning project (create, list filter)" },
            "name": { "type": "string" },
            "description": { "type": "string" },
            "status": { "type": "string", "enum": TaskStatus::names() },
            "priority": { "type": "string", "enum": Priority::names() },
            "agent_id": { "type": "string", "description": "Agent to assign (assign_agent)" },
            "limit": { "type": "integer" },
            "offset": { "type": "integer" }
        }),
        vec![],
    )
}

pub fn manage(services: &Services, user_id: &str, args: &Value) -> ApiResult<Value> {
    let action = require_string(args, "action")?;
    let branches = &services.branches;
    match action.as_str() {
        "create" => {
            let project_id = require_string(args, "project_id")?;
            let name = require_string(args, "name")?;
            let description = get_string(args, "description");
            let priority = get_parsed::<Priority>(args, "priority")?;
            to_json(branches.create(user_id, &project_id, &name, description.as_deref(), priority)?)
        }
        "get" => to_json(branches.get(user_id, &require_string(args, "branch_id")?)?),
        "list" => {
            let project_id = get_string(args, "project_id");
            let limit = clamp_limit(get_i64(args, "limit"));
            let offset = get_i64(args, "offset").unwrap_or(0).max(0);
            let list = branches.list(user_id, project_id.as_deref(), limit, offset)?;
            Ok(json!({ "branches": list, "count": list.len() }))
        }
        "update" => {
            let branch_id = require_string(args, "branch_id")?;
            let update: BranchUpdate = from_args(args)?;
            to_json(branches.update(user_id, &branch_id, &update)?)
        }
        "delete" => to_json(branches.delete(user_id, &require_string(args, "branch_id")?)?),
        "assign_agent" => {
            let branch_id = require_string(args, "branch_id")?;
            let agent_id = require_string(args, "agent_id")?;
            to_json(branches.assign_agent(user_id, &branch_id, &agent_id)?)
        }
        "unassign_agent" => to_json(branches.unassign_agent(user_id, &require_string(args, "branch_id")?)?),
        "statistics" => to_json(branches.statistics(user_id, &require_string(args, "branch_id")?)?),
        other => Err(unknown_action("manage_branch", other)),
    }
}
