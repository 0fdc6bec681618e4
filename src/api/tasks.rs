//! Task, dependency and subtask routes under `/api/v2/tasks`.

use super::{ApiResponse, AppState, JsonBody, OptionalJson, QueryParams, created, ok};
use crate::auth::AuthenticatedUser;
use crate::types::{NewSubtask, NewTask, SubtaskUpdate, TaskFilter, TaskUpdate};
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize)]
struct NextQuery {
    #[serde(default)]
    branch_id: Option<String>,
    #[serde(default)]
    project_id: Option<String>,
}

#[derive(Deserialize, Default)]
struct CompleteRequest {
    #[serde(default)]
    completion_summary: Option<String>,
    #[serde(default)]
    testing_notes: Option<String>,
}

#[derive(Deserialize)]
struct ProgressRequest {
    percentage: i32,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Deserialize)]
struct DependencyRequest {
    depends_on: String,
}

async fn list(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    QueryParams(filter): QueryParams<TaskFilter>,
) -> ApiResponse {
    Ok(ok(state.services.tasks.list(user.id(), &filter)?))
}

async fn create(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    JsonBody(input): JsonBody<NewTask>,
) -> ApiResponse {
    let task = state.services.tasks.create(user.id(), input)?;
    Ok(created(task).message("Task created"))
}

async fn next(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    QueryParams(query): QueryParams<NextQuery>,
) -> ApiResponse {
    let task = state.services.tasks.next(
        user.id(),
        query.branch_id.as_deref(),
        query.project_id.as_deref(),
    )?;
    match task {
        Some(task) => Ok(ok(json!({ "task": task }))),
        None => Ok(ok(json!({ "task": null })).message("No actionable tasks")),
    }
}

async fn get_one(State(state): State<AppState>, user: AuthenticatedUser, Path(id): Path<String>) -> ApiResponse {
    Ok(ok(state.services.tasks.get(user.id(), &id)?))
}

async fn update(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    JsonBody(update): JsonBody<TaskUpdate>,
) -> ApiResponse {
    Ok(ok(state.services.tasks.update(user.id(), &id, &update)?).message("Task updated"))
}

async fn remove(State(state): State<AppState>, user: AuthenticatedUser, Path(id): Path<String>) -> ApiResponse {
    let report = state.services.tasks.delete(user.id(), &id)?;
    Ok(ok(report).message("Task deleted"))
}

async fn complete(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    OptionalJson(req): OptionalJson<CompleteRequest>,
) -> ApiResponse {
    let task = state.services.tasks.complete(
        user.id(),
        &id,
        req.completion_summary.as_deref(),
        req.testing_notes.as_deref(),
    )?;
    Ok(ok(task).message("Task completed"))
}

async fn progress(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<ProgressRequest>,
) -> ApiResponse {
    let task = state
        .services
        .progress
        .update_progress(user.id(), &id, req.percentage, req.notes.as_deref())?;
    Ok(ok(task))
}

async fn dependencies(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> ApiResponse {
    let task = state.services.tasks.get(user.id(), &id)?;
    let blockers = state.services.tasks.blockers(user.id(), &id)?;
    Ok(ok(json!({
        "task_id": task.id,
        "dependencies": task.dependencies,
        "blocked_by": blockers,
    })))
}

async fn add_dependency(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<DependencyRequest>,
) -> ApiResponse {
    let task = state.services.tasks.add_dependency(user.id(), &id, &req.depends_on)?;
    Ok(ok(task).message("Dependency added"))
}

async fn remove_dependency(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((id, depends_on)): Path<(String, String)>,
) -> ApiResponse {
    let task = state.services.tasks.remove_dependency(user.id(), &id, &depends_on)?;
    Ok(ok(task).message("Dependency removed"))
}

async fn list_subtasks(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> ApiResponse {
    let subtasks = state.services.subtasks.list(user.id(), &id)?;
    Ok(ok(json!({ "subtasks": subtasks, "count": subtasks.len() })))
}

async fn create_subtask(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    JsonBody(input): JsonBody<NewSubtask>,
) -> ApiResponse {
    let subtask = state.services.subtasks.create(user.id(), &id, input)?;
    Ok(created(subtask).message("Subtask created"))
}

async fn get_subtask(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((id, subtask_id)): Path<(String, String)>,
) -> ApiResponse {
    Ok(ok(state.services.subtasks.get(user.id(), &id, &subtask_id)?))
}

async fn update_subtask(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((id, subtask_id)): Path<(String, String)>,
    JsonBody(update): JsonBody<SubtaskUpdate>,
) -> ApiResponse {
    let subtask = state
        .services
        .subtasks
        .update(user.id(), &id, &subtask_id, &update)?;
    Ok(ok(subtask).message("Subtask updated"))
}

async fn delete_subtask(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((id, subtask_id)): Path<(String, String)>,
) -> ApiResponse {
    state.services.subtasks.delete(user.id(), &id, &subtask_id)?;
    Ok(ok(json!({ "deleted": subtask_id })).message("Subtask deleted"))
}

async fn complete_subtask(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((id, subtask_id)): Path<(String, String)>,
    OptionalJson(req): OptionalJson<CompleteRequest>,
) -> ApiResponse {
    let subtask = state.services.subtasks.complete(
        user.id(),
        &id,
        &subtask_id,
        req.completion_summary.as_deref(),
    )?;
    Ok(ok(subtask).message("Subtask completed"))
}

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/next", get(next))
        .route("/{id}", get(get_one).put(update).patch(update).delete(remove))
        .route("/{id}/complete", post(complete))
        .route("/{id}/progress", post(progress))
        .route("/{id}/dependencies", get(dependencies).post(add_dependency))
        .route("/{id}/dependencies/{depends_on}", delete(remove_dependency))
        .route("/{id}/subtasks", get(list_subtasks).post(create_subtask))
        .route(
            "/{id}/subtasks/{subtask_id}",
            get(get_subtask).put(update_subtask).patch(update_subtask).delete(delete_subtask),
        )
        .route("/{id}/subtasks/{subtask_id}/complete", post(complete_subtask))
}
