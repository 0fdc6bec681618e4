//! MCP tool dispatch tests.

use serde_json::{Value, json};
use taskhub_server::error::ErrorCode;
use taskhub_server::mcp::tool_result;
use taskhub_server::services::Services;
use taskhub_server::tools::ToolHandler;

fn handler() -> ToolHandler {
    ToolHandler::new(Services::in_memory().expect("Failed to create services"), "u1")
}

fn call(handler: &ToolHandler, tool: &str, args: Value) -> Value {
    handler
        .call_tool(tool, args)
        .unwrap_or_else(|e| panic!("{} failed: {}", tool, e))
}

/// Create a project, branch and task through the tools. Returns their IDs.
fn seed(handler: &ToolHandler) -> (String, String, String) {
    let project = call(handler, "manage_project", json!({ "action": "create", "name": "alpha" }));
    let project_id = project["id"].as_str().unwrap().to_string();
    let branch = call(
        handler,
        "manage_branch",
        json!({ "action": "create", "project_id": project_id, "name": "main", "priority": "high" }),
    );
    let branch_id = branch["id"].as_str().unwrap().to_string();
    let task = call(
        handler,
        "manage_task",
        json!({ "action": "create", "branch_id": branch_id, "title": "wire tools", "labels": ["mcp"] }),
    );
    let task_id = task["id"].as_str().unwrap().to_string();
    (project_id, branch_id, task_id)
}

#[test]
fn lists_every_tool() {
    let names: Vec<String> = handler()
        .get_tools()
        .into_iter()
        .map(|tool| tool.name.to_string())
        .collect();
    assert_eq!(
        names,
        vec!["manage_project", "manage_branch", "manage_task", "manage_subtask", "manage_context"]
    );
}

#[test]
fn unknown_tool_and_action_are_rejected() {
    let handler = handler();
    let err = handler.call_tool("manage_everything", json!({})).unwrap_err();
    assert_eq!(err.code, ErrorCode::UnknownTool);

    let err = handler
        .call_tool("manage_project", json!({ "action": "explode" }))
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidFieldValue);
    assert_eq!(err.field.as_deref(), Some("action"));

    let err = handler.call_tool("manage_project", json!({})).unwrap_err();
    assert_eq!(err.code, ErrorCode::MissingRequiredField);
}

#[test]
fn task_flow_through_tools() {
    let handler = handler();
    let (_, branch_id, task_id) = seed(&handler);

    let subtask = call(
        &handler,
        "manage_subtask",
        json!({ "action": "create", "task_id": task_id, "title": "schema" }),
    );
    let subtask_id = subtask["id"].as_str().unwrap().to_string();
    call(
        &handler,
        "manage_subtask",
        json!({ "action": "complete", "task_id": task_id, "subtask_id": subtask_id }),
    );

    let task = call(&handler, "manage_task", json!({ "action": "get", "task_id": task_id }));
    assert_eq!(task["progress_percentage"], 100);

    let next = call(&handler, "manage_task", json!({ "action": "next", "branch_id": branch_id }));
    assert_eq!(next["task"]["id"], task_id.as_str());

    let done = call(&handler, "manage_task", json!({ "action": "complete", "task_id": task_id }));
    assert_eq!(done["status"], "done");

    let stats = call(&handler, "manage_branch", json!({ "action": "statistics", "branch_id": branch_id }));
    assert_eq!(stats["completed_tasks"], 1);
}

#[test]
fn bad_enum_argument_names_the_field() {
    let handler = handler();
    let (project_id, _, _) = seed(&handler);
    let err = handler
        .call_tool(
            "manage_branch",
            json!({ "action": "create", "project_id": project_id, "name": "b", "priority": "whenever" }),
        )
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidFieldValue);
    assert_eq!(err.field.as_deref(), Some("priority"));
}

#[test]
fn global_context_accepts_alias() {
    let handler = handler();
    let created = call(
        &handler,
        "manage_context",
        json!({ "action": "create", "level": "global", "data": { "tone": "terse" } }),
    );
    assert_eq!(created["context"]["data"]["tone"], "terse");

    let fetched = call(
        &handler,
        "manage_context",
        json!({ "action": "get", "level": "global", "context_id": "global" }),
    );
    assert_eq!(fetched["data"]["tone"], "terse");
}

#[test]
fn errors_become_flagged_tool_results() {
    let handler = handler();
    let result = tool_result(handler.call_tool("manage_task", json!({ "action": "get", "task_id": "missing" })));
    assert_eq!(result.is_error, Some(true));

    let result = tool_result(handler.call_tool("manage_project", json!({ "action": "list" })));
    assert_eq!(result.is_error, None);
}
