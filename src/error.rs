//! Structured error types for HTTP and MCP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;
use std::fmt;

/// Message returned to clients for internal failures. Details go to the log.
pub const GENERIC_FAILURE: &str = "operation failed";

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors
    MissingRequiredField,
    InvalidFieldValue,
    InvalidState,

    // Authentication / authorization
    Unauthorized,
    InvalidCredentials,
    TokenExpired,
    TokenRevoked,
    Forbidden,
    ProviderUnsupported,

    // Not found errors
    UserNotFound,
    ProjectNotFound,
    BranchNotFound,
    TaskNotFound,
    SubtaskNotFound,
    ContextNotFound,
    DelegationNotFound,

    // Conflict errors
    AlreadyExists,
    DependencyCycle,

    // Internal errors
    DatabaseError,
    PoolExhausted,
    InternalError,
    UnknownTool,
}

impl ErrorCode {
    /// HTTP status for this code.
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::MissingRequiredField
            | ErrorCode::InvalidFieldValue
            | ErrorCode::InvalidState
            | ErrorCode::ProviderUnsupported
            | ErrorCode::UnknownTool => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized
            | ErrorCode::InvalidCredentials
            | ErrorCode::TokenExpired
            | ErrorCode::TokenRevoked => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::UserNotFound
            | ErrorCode::ProjectNotFound
            | ErrorCode::BranchNotFound
            | ErrorCode::TaskNotFound
            | ErrorCode::SubtaskNotFound
            | ErrorCode::ContextNotFound
            | ErrorCode::DelegationNotFound => StatusCode::NOT_FOUND,
            ErrorCode::AlreadyExists | ErrorCode::DependencyCycle => StatusCode::CONFLICT,
            ErrorCode::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::DatabaseError | ErrorCode::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Internal errors never leak their message to clients.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            ErrorCode::DatabaseError | ErrorCode::InternalError | ErrorCode::PoolExhausted
        )
    }
}

/// Structured API error.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: None,
            details: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    // Convenience constructors

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingRequiredField,
            format!("{} is required", field),
        )
        .with_field(field)
    }

    pub fn invalid_value(field: &str, reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidFieldValue, reason).with_field(field)
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidState, reason)
    }

    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, reason)
    }

    pub fn invalid_credentials() -> Self {
        Self::new(ErrorCode::InvalidCredentials, "Invalid credentials")
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, reason)
    }

    pub fn user_not_found(user_id: &str) -> Self {
        Self::new(ErrorCode::UserNotFound, format!("User not found: {}", user_id))
    }

    pub fn project_not_found(project_id: &str) -> Self {
        Self::new(
            ErrorCode::ProjectNotFound,
            format!("Project not found: {}", project_id),
        )
    }

    pub fn branch_not_found(branch_id: &str) -> Self {
        Self::new(
            ErrorCode::BranchNotFound,
            format!("Branch not found: {}", branch_id),
        )
    }

    pub fn task_not_found(task_id: &str) -> Self {
        Self::new(
            ErrorCode::TaskNotFound,
            format!("Task not found: {}", task_id),
        )
    }

    pub fn subtask_not_found(subtask_id: &str) -> Self {
        Self::new(
            ErrorCode::SubtaskNotFound,
            format!("Subtask not found: {}", subtask_id),
        )
    }

    pub fn context_not_found(level: &str, context_id: &str) -> Self {
        Self::new(
            ErrorCode::ContextNotFound,
            format!("{} context not found: {}", level, context_id),
        )
    }

    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::new(ErrorCode::AlreadyExists, what)
    }

    pub fn dependency_cycle(task_id: &str, depends_on: &str) -> Self {
        Self::new(
            ErrorCode::DependencyCycle,
            format!(
                "Adding dependency {} -> {} would create a cycle",
                task_id, depends_on
            ),
        )
    }

    pub fn database(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::DatabaseError, err.to_string())
    }

    pub fn internal(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::InternalError, err.to_string())
    }

    pub fn unknown_tool(name: &str) -> Self {
        Self::new(ErrorCode::UnknownTool, format!("Unknown tool: {}", name))
    }

    /// Client-facing JSON body. Internal errors are reduced to a generic message.
    pub fn to_body(&self) -> serde_json::Value {
        if self.code.is_internal() {
            return json!({
                "success": false,
                "error": self.code,
                "message": GENERIC_FAILURE,
            });
        }
        let mut body = json!({
            "success": false,
            "error": self.code,
            "message": self.message,
        });
        if let Some(ref field) = self.field {
            body["field"] = json!(field);
        }
        if let Some(ref details) = self.details {
            body["details"] = json!(details);
        }
        body
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

// Allow using ? with anyhow errors by converting them
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ApiError>() {
            Ok(api_err) => api_err,
            Err(err) => match err.downcast::<crate::db::pool::PoolError>() {
                Ok(pool_err) => Self::new(ErrorCode::PoolExhausted, pool_err.to_string()),
                Err(err) => match err.downcast::<rusqlite::Error>() {
                    Ok(db_err) => ApiError::database(db_err),
                    Err(err) => ApiError::internal(err),
                },
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.code.status();
        if self.code.is_internal() {
            tracing::error!(error_code = ?self.code, error = %self.message, "Request failed");
        } else {
            tracing::debug!(error_code = ?self.code, error = %self.message, "Request rejected");
        }
        (status, Json(self.to_body())).into_response()
    }
}

/// Result type for service operations.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let err = ApiError::task_not_found("abc");
        assert_eq!(err.code.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.to_body()["error"], "TASK_NOT_FOUND");
        assert_eq!(err.to_body()["success"], false);
    }

    #[test]
    fn internal_errors_hide_details() {
        let err = ApiError::database("no such table: tasks");
        let body = err.to_body();
        assert_eq!(body["message"], GENERIC_FAILURE);
        assert!(!body.to_string().contains("no such table"));
    }

    #[test]
    fn anyhow_round_trip_keeps_api_error() {
        let err: anyhow::Error = ApiError::missing_field("title").into();
        let api: ApiError = err.into();
        assert_eq!(api.code, ErrorCode::MissingRequiredField);
        assert_eq!(api.field.as_deref(), Some("title"));
    }

    #[test]
    fn pool_exhaustion_maps_to_unavailable() {
        use crate::config::PoolConfig;
        use crate::db::pool::ConnectionPool;

        let pool = ConnectionPool::new(
            PoolConfig {
                pool_size: 1,
                max_overflow: 0,
                recycle_seconds: 0,
                idle_timeout_seconds: 0,
                timeout_ms: 20,
                pre_ping: false,
            },
            r2d2_sqlite::SqliteConnectionManager::memory(),
        )
        .unwrap();
        let _held = pool.get().unwrap();
        let err: anyhow::Error = pool.get().map(|_| ()).unwrap_err().into();
        let api: ApiError = err.into();
        assert_eq!(api.code, ErrorCode::PoolExhausted);
        assert_eq!(api.code.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(api.to_body()["message"], GENERIC_FAILURE);
    }

    #[test]
    fn plain_anyhow_becomes_internal() {
        let api: ApiError = anyhow::anyhow!("boom").into();
        assert_eq!(api.code, ErrorCode::InternalError);
    }
}
