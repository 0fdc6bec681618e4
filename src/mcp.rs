//! MCP server over stdio.
//!
//! Every tool call runs as the user identified by the bearer token given at
//! startup. Failures come back as the API error body with `is_error` set.

use crate::api::{AppState, start_server};
use crate::auth::{AuthService, User};
use crate::error::ApiError;
use crate::services::Services;
use crate::tools::ToolHandler;
use anyhow::Result;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, Content, InitializeResult, ListToolsResult,
    PaginatedRequestParams, ServerCapabilities,
};
use rmcp::service::RequestContext;
use rmcp::transport::io::stdio;
use rmcp::{ErrorData, RoleServer, ServerHandler, ServiceExt};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

const INSTRUCTIONS: &str = "\
Task hub for projects, branches, tasks and hierarchical context. \
Start with manage_project(action=\"list\"), then manage_task(action=\"next\") to pick up work. \
Use manage_context(action=\"resolve\") to read inherited settings for a level.";

/// HTTP listener to run alongside the stdio server.
pub struct HttpOptions {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

#[derive(Clone)]
pub struct TaskHubServer {
    tool_handler: Arc<ToolHandler>,
}

impl TaskHubServer {
    pub fn new(services: Services, user: &User) -> Self {
        Self {
            tool_handler: Arc::new(ToolHandler::new(services, user.id.clone())),
        }
    }

    pub fn tool_handler(&self) -> &ToolHandler {
        &self.tool_handler
    }
}

/// Tool output as a `CallToolResult`.
pub fn tool_result(result: Result<Value, ApiError>) -> CallToolResult {
    match result {
        Ok(value) => CallToolResult {
            content: vec![Content::text(value.to_string())],
            is_error: None,
            meta: None,
            structured_content: None,
        },
        Err(e) => CallToolResult {
            content: vec![Content::text(e.to_body().to_string())],
            is_error: Some(true),
            meta: None,
            structured_content: None,
        },
    }
}

impl ServerHandler for TaskHubServer {
    fn get_info(&self) -> InitializeResult {
        InitializeResult {
            protocol_version: Default::default(),
            server_info: rmcp::model::Implementation {
                name: "taskhub-server".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                ..Default::default()
            },
            capabilities: ServerCapabilities {
                tools: Some(rmcp::model::ToolsCapability::default()),
                ..Default::default()
            },
            instructions: Some(INSTRUCTIONS.to_string()),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<ListToolsResult, ErrorData> {
        Ok(ListToolsResult {
            tools: self.tool_handler.get_tools(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let tool_name = request.name.to_string();
        let start = std::time::Instant::now();
        let args = Value::Object(request.arguments.unwrap_or_default());

        let handler = Arc::clone(&self.tool_handler);
        let name = tool_name.clone();
        let result = tokio::task::spawn_blocking(move || handler.call_tool(&name, args))
            .await
            .unwrap_or_else(|e| Err(ApiError::internal(e)));

        let duration_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(_) => debug!(tool = %tool_name, duration_ms, "Tool call succeeded"),
            Err(ref e) => warn!(
                tool = %tool_name,
                error_code = ?e.code,
                error_message = %e.message,
                duration_ms,
                "Tool call failed"
            ),
        }
        Ok(tool_result(result))
    }
}

/// Serve MCP on stdio as the owner of `token`, optionally with the HTTP API.
pub async fn run_mcp(
    services: Services,
    auth: Arc<AuthService>,
    token: &str,
    http: Option<HttpOptions>,
) -> Result<()> {
    let user = auth
        .authenticate(token)
        .await
        .map_err(|e| anyhow::anyhow!("MCP token rejected: {}", e.message))?;
    info!(user_id = %user.id, username = %user.username, "MCP session authenticated");

    let http_handle = match http {
        Some(options) => {
            let state = AppState::new(services.clone(), Arc::clone(&auth));
            Some(start_server(state, &options.host, options.port, &options.cors_origins).await?)
        }
        None => None,
    };

    let server = TaskHubServer::new(services, &user);
    info!("Server ready, listening on stdio");
    let service = server.serve(stdio()).await?;
    service.waiting().await?;

    if let Some(handle) = http_handle {
        handle.shutdown().await;
    }
    Ok(())
}
