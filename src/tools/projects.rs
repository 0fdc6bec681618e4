//! `manage_project` tool.

use super::{from_args, get_i64, get_parsed, get_string, make_tool, require_string, to_json, unknown_action};
use crate::error::ApiResult;
use crate::services::Services;
use crate::types::{ProjectStatus, ProjectUpdate, clamp_limit};
use rmcp::model::Tool;
use serde_json::{Value, json};

const ACTIONS: &[&str] = &["create", "get", "list", "update", "delete", "summary", "overview"];

pub fn tool() -> Tool {
    make_tool(
        "manage_project",
        "Create, inspect, update and delete projects. Deleting a project removes its branches, tasks and contexts.",
        ACTIONS,
        json!({
            "project_id": { "type": "string", "description": "Project ID (get, update, delete, summary)" },
            "name": { "type": "string", "description": "Project name (create, update)" },
            "description": { "type": "string" },
            "status": { "type": "string", "enum": ProjectStatus::names() },
            "metadata": { "type": "object" },
            "limit": { "type": "integer" },
            "offset": { "type": "integer" }
        }),
        vec![],
    )
}

pub fn manage(services: &Services, user_id: &str, args: &Value) -> ApiResult<Value> {
    let action = require_string(args, "action")?;
    let projects = &services.projects;
    match action.as_str() {
        "create" => {
            let name = require_string(args, "name")?;
            let description = get_string(args, "description");
            let metadata = args.get("metadata").cloned();
            to_json(projects.create(user_id, &name, description.as_deref(), metadata)?)
        }
        "get" => to_json(projects.get(user_id, &require_string(args, "project_id")?)?),
        "list" => {
            let status = get_parsed::<ProjectStatus>(args, "status")?;
            let limit = clamp_limit(get_i64(args, "limit"));
            let offset = get_i64(args, "offset").unwrap_or(0).max(0);
            let list = projects.list(user_id, status, limit, offset)?;
            Ok(json!({ "projects": list, "count": list.len() }))
        }
        "update" => {
            let project_id = require_string(args, "project_id")?;
            let update: ProjectUpdate = from_args(args)?;
            to_json(projects.update(user_id, &project_id, &update)?)
        }
        "delete" => to_json(projects.delete(user_id, &require_string(args, "project_id")?)?),
        "summary" => to_json(projects.summary(user_id, &require_string(args, "project_id")?)?),
        "overview" => to_json(projects.overview(user_id)?),
        other => Err(unknown_action("manage_project", other)),
    }
}
