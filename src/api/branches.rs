use super::{ApiResponse, AppState, JsonBody, Page, QueryParams, created, ok};
use crate::auth::AuthenticatedUser;
use crate::types::{BranchUpdate, Priority};
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize)]
struct CreateBranch {
    project_id: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    priority: Option<Priority>,
}

#[derive(Deserialize)]
struct ListBranches {
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

#[derive(Deserialize)]
struct AssignAgent {
    agent_id: String,
}

async fn list(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    QueryParams(query): QueryParams<ListBranches>,
) -> ApiResponse {
    let page = Page {
        limit: query.limit,
        offset: query.offset,
    };
    let branches = state.services.branches.list(
        user.id(),
        query.project_id.as_deref(),
        page.limit(),
        page.offset(),
    )?;
    Ok(ok(json!({ "branches": branches, "count": branches.len() })))
}

async fn create(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    JsonBody(req): JsonBody<CreateBranch>,
) -> ApiResponse {
    let branch = state.services.branches.create(
        user.id(),
        &req.project_id,
        &req.name,
        req.description.as_deref(),
        req.priority,
    )?;
    Ok(created(branch).message("Branch created"))
}

async fn get_one(State(state): State<AppState>, user: AuthenticatedUser, Path(id): Path<String>) -> ApiResponse {
    Ok(ok(state.services.branches.get(user.id(), &id)?))
}

async fn update(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    JsonBody(update): JsonBody<BranchUpdate>,
) -> ApiResponse {
    Ok(ok(state.services.branches.update(user.id(), &id, &update)?).message("Branch updated"))
}

async fn delete(State(state): State<AppState>, user: AuthenticatedUser, Path(id): Path<String>) -> ApiResponse {
    let report = state.services.branches.delete(user.id(), &id)?;
    Ok(ok(report).message("Branch deleted"))
}

async fn assign(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<AssignAgent>,
) -> ApiResponse {
    let branch = state.services.branches.assign_agent(user.id(), &id, &req.agent_id)?;
    Ok(ok(branch).message("Agent assigned"))
}

async fn unassign(State(state): State<AppState>, user: AuthenticatedUser, Path(id): Path<String>) -> ApiResponse {
    Ok(ok(state.services.branches.unassign_agent(user.id(), &id)?).message("Agent unassigned"))
}

async fn statistics(State(state): State<AppState>, user: AuthenticatedUser, Path(id): Path<String>) -> ApiResponse {
    Ok(ok(state.services.branches.statistics(user.id(), &id)?))
}

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/{id}", get(get_one).put(update).patch(update).delete(delete))
        .route("/{id}/assign", post(assign))
        .route("/{id}/unassign", post(unassign))
        .route("/{id}/statistics", get(statistics))
}
