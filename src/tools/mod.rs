//! MCP tool implementations.
//!
//! Each tool takes an `action` argument and dispatches to the matching
//! service call on behalf of a single user.

pub mod branches;
pub mod contexts;
pub mod projects;
pub mod subtasks;
pub mod tasks;

use crate::error::{ApiError, ApiResult};
use crate::services::Services;
use rmcp::model::Tool;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::str::FromStr;

/// Tool handler that processes MCP tool calls.
pub struct ToolHandler {
    pub services: Services,
    pub user_id: String,
}

impl ToolHandler {
    pub fn new(services: Services, user_id: impl Into<String>) -> Self {
        Self {
            services,
            user_id: user_id.into(),
        }
    }

    /// Get all available tools.
    pub fn get_tools(&self) -> Vec<Tool> {
        vec![
            projects::tool(),
            branches::tool(),
            tasks::tool(),
            subtasks::tool(),
            contexts::tool(),
        ]
    }

    /// Call a tool by name.
    pub fn call_tool(&self, name: &str, arguments: Value) -> ApiResult<Value> {
        let services = &self.services;
        let user = self.user_id.as_str();
        match name {
            "manage_project" => projects::manage(services, user, &arguments),
            "manage_branch" => branches::manage(services, user, &arguments),
            "manage_task" => tasks::manage(services, user, &arguments),
            "manage_subtask" => subtasks::manage(services, user, &arguments),
            "manage_context" => contexts::manage(services, user, &arguments),
            _ => Err(ApiError::unknown_tool(name)),
        }
    }
}

/// Helper to create a tool definition. `action` is always required.
pub fn make_tool(name: &str, description: &str, actions: &[&str], properties: Value, required: Vec<&str>) -> Tool {
    let mut properties = match properties {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    properties.insert(
        "action".to_string(),
        serde_json::json!({
            "type": "string",
            "enum": actions,
            "description": "Operation to perform"
        }),
    );
    let mut required_fields = vec!["action"];
    required_fields.extend(required);

    let input_schema = rmcp::model::JsonObject::from_iter([
        ("type".to_string(), serde_json::json!("object")),
        ("properties".to_string(), Value::Object(properties)),
        ("required".to_string(), serde_json::json!(required_fields)),
    ]);

    Tool::new(name.to_string(), description.to_string(), input_schema)
}

/// Helper to get a string from arguments.
pub fn get_string(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str().map(String::from))
}

/// Like [`get_string`], but a missing or blank value is an error.
pub fn require_string(args: &Value, key: &str) -> ApiResult<String> {
    get_string(args, key)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ApiError::missing_field(key))
}

pub fn get_i64(args: &Value, key: &str) -> Option<i64> {
    args.get(key).and_then(|v| v.as_i64())
}

pub fn get_bool(args: &Value, key: &str) -> Option<bool> {
    args.get(key).and_then(|v| v.as_bool())
}

/// Parse an optional enum-valued string argument.
pub fn get_parsed<T>(args: &Value, key: &str) -> ApiResult<Option<T>>
where
    T: FromStr<Err = String>,
{
    match get_string(args, key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|reason| ApiError::invalid_value(key, reason)),
        None => Ok(None),
    }
}

/// Deserialize the whole argument object into an input type.
pub fn from_args<T: DeserializeOwned>(args: &Value) -> ApiResult<T> {
    let mut object = args.clone();
    if let Some(map) = object.as_object_mut() {
        map.remove("action");
    }
    serde_json::from_value(object).map_err(|e| ApiError::invalid_value("arguments", e.to_string()))
}

pub fn unknown_action(tool: &str, action: &str) -> ApiError {
    ApiError::invalid_value("action", format!("Unknown action '{}' for {}", action, tool))
}

pub fn to_json(value: impl serde::Serialize) -> ApiResult<Value> {
    serde_json::to_value(value).map_err(ApiError::internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;
    use serde_json::json;

    #[test]
    fn require_string_rejects_blank() {
        let args = json!({ "name": "  ", "id": "abc" });
        assert_eq!(require_string(&args, "id").unwrap(), "abc");
        assert!(require_string(&args, "name").is_err());
        assert!(require_string(&args, "missing").is_err());
    }

    #[test]
    fn get_parsed_reports_bad_values() {
        let args = json!({ "priority": "HIGH", "bad": "urgentish" });
        assert_eq!(get_parsed::<Priority>(&args, "priority").unwrap(), Some(Priority::High));
        assert_eq!(get_parsed::<Priority>(&args, "absent").unwrap(), None);
        assert!(get_parsed::<Priority>(&args, "bad").is_err());
    }

    #[test]
    fn tool_schema_requires_action() {
        let tool = make_tool("manage_x", "x", &["create"], json!({ "id": { "type": "string" } }), vec!["id"]);
        let schema = serde_json::to_value(tool.input_schema.as_ref()).unwrap();
        assert_eq!(schema["required"], json!(["action", "id"]));
        assert_eq!(schema["properties"]["action"]["enum"], json!(["create"]));
    }
}
