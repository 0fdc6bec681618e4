//! `manage_context` tool.

use super::{from_args, get_bool, get_i64, get_parsed, get_string, make_tool, require_string, to_json, unknown_action};
use crate::context::{ContextLevel, ContextUpdate, DelegationStatus, GLOBAL_ALIAS};
use crate::error::{ApiError, ApiResult};
use crate::services::Services;
use crate::types::clamp_limit;
use rmcp::model::Tool;
use serde_json::{Value, json};

const ACTIONS: &[&str] = &[
    "create",
    "get",
    "list",
    "update",
    "delete",
    "resolve",
    "delegate",
    "add_insight",
    "add_progress",
    "validate",
    "invalidate",
    "list_delegations",
    "process_delegation",
];

pub fn tool() -> Tool {
    make_tool(
        "manage_context",
        "Manage the global/project/branch/task context hierarchy: CRUD, inherited resolution, delegation upward, insights and progress notes.",
        ACTIONS,
        json!({
            "level": { "type": "string", "enum": ContextLevel::names() },
            "context_id": {
                "type": "string",
                "description": format!("Entity ID at the given level; use '{}' for the global context", GLOBAL_ALIAS)
            },
            "data": { "type": "object" },
            "local_overrides": { "type": "object" },
            "delegation_rules": { "type": "object" },
            "inheritance_disabled": { "type": "boolean" },
            "merge": { "type": "boolean", "description": "Deep-merge data on update (default true)" },
            "force_refresh": { "type": "boolean" },
            "target_level": { "type": "string", "enum": ContextLevel::names() },
            "reason": { "type": "string" },
            "content": { "type": "string" },
            "category": { "type": "string" },
            "importance": { "type": "string" },
            "agent": { "type": "string" },
            "delegation_id": { "type": "string" },
            "approve": { "type": "boolean" },
            "status": { "type": "string", "enum": DelegationStatus::names() },
            "limit": { "type": "integer" },
            "offset": { "type": "integer" }
        }),
        vec![],
    )
}

fn level(args: &Value, key: &str) -> ApiResult<ContextLevel> {
    get_parsed::<ContextLevel>(args, key)?.ok_or_else(|| ApiError::missing_field(key))
}

/// Global contexts may omit the id.
fn context_id(args: &Value, level: ContextLevel) -> ApiResult<String> {
    match get_string(args, "context_id") {
        Some(id) if !id.trim().is_empty() => Ok(id),
        _ if level == ContextLevel::Global => Ok(GLOBAL_ALIAS.to_string()),
        _ => Err(ApiError::missing_field("context_id")),
    }
}

pub fn manage(services: &Services, user_id: &str, args: &Value) -> ApiResult<Value> {
    let action = require_string(args, "action")?;
    let contexts = &services.contexts;
    match action.as_str() {
        "list_delegations" => {
            let status = get_parsed::<DelegationStatus>(args, "status")?;
            let limit = clamp_limit(get_i64(args, "limit"));
            let list = contexts.list_delegations(user_id, status, limit)?;
            return Ok(json!({ "delegations": list, "count": list.len() }));
        }
        "process_delegation" => {
            let delegation_id = require_string(args, "delegation_id")?;
            let approve = get_bool(args, "approve").ok_or_else(|| ApiError::missing_field("approve"))?;
            return to_json(contexts.process_delegation(user_id, &delegation_id, approve)?);
        }
        _ => {}
    }

    let level = level(args, "level")?;
    if action == "list" {
        let limit = clamp_limit(get_i64(args, "limit"));
        let offset = get_i64(args, "offset").unwrap_or(0).max(0);
        let list = contexts.list(user_id, level, limit, offset)?;
        return Ok(json!({ "contexts": list, "count": list.len() }));
    }

    let id = context_id(args, level)?;
    match action.as_str() {
        "create" => to_json(contexts.create(user_id, level, &id, args.get("data").cloned())?),
        "get" => to_json(contexts.get(user_id, level, &id)?),
        "update" => {
            let update: ContextUpdate = from_args(args)?;
            to_json(contexts.update(user_id, level, &id, update)?)
        }
        "delete" => {
            contexts.delete(user_id, level, &id)?;
            Ok(json!({ "deleted": true, "level": level, "context_id": id }))
        }
        "resolve" => {
            let force = get_bool(args, "force_refresh").unwrap_or(false);
            to_json(contexts.resolve(user_id, level, &id, force)?)
        }
        "delegate" => {
            let target = self::level(args, "target_level")?;
            let data = args.get("data").cloned().ok_or_else(|| ApiError::missing_field("data"))?;
            let reason = get_string(args, "reason").unwrap_or_default();
            to_json(contexts.delegate(user_id, level, &id, target, data, &reason)?)
        }
        "add_insight" => {
            let content = require_string(args, "content")?;
            let category = get_string(args, "category");
            let importance = get_string(args, "importance");
            to_json(contexts.add_insight(
                user_id,
                level,
                &id,
                &content,
                category.as_deref(),
                importance.as_deref(),
            )?)
        }
        "add_progress" => {
            let content = require_string(args, "content")?;
            let agent = get_string(args, "agent");
            to_json(contexts.add_progress(user_id, level, &id, &content, agent.as_deref())?)
        }
        "validate" => to_json(contexts.validate(user_id, level, &id)?),
        "invalidate" => {
            let reason = get_string(args, "reason").unwrap_or_else(|| "manual".to_string());
            let count = contexts.invalidate(user_id, level, &id, &reason)?;
            Ok(json!({ "invalidated": count }))
        }
        other => Err(unknown_action("manage_context", other)),
    }
}
