use super::{ApiResponse, AppState, JsonBody, Page, QueryParams, created, ok};
use crate::auth::AuthenticatedUser;
use crate::types::{ProjectStatus, ProjectUpdate};
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::get;
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Deserialize)]
struct CreateProject {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Deserialize)]
struct ListProjects {
    #[serde(default)]
    status: Option<ProjectStatus>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

async fn list(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    QueryParams(query): QueryParams<ListProjects>,
) -> ApiResponse {
    let page = Page {
        limit: query.limit,
        offset: query.offset,
    };
    let projects = state
        .services
        .projects
        .list(user.id(), query.status, page.limit(), page.offset())?;
    Ok(ok(json!({ "projects": projects, "count": projects.len() })))
}

async fn create(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    JsonBody(req): JsonBody<CreateProject>,
) -> ApiResponse {
    let project = state.services.projects.create(
        user.id(),
        &req.name,
        req.description.as_deref(),
        req.metadata,
    )?;
    Ok(created(project).message("Project created"))
}

async fn get_one(State(state): State<AppState>, user: AuthenticatedUser, Path(id): Path<String>) -> ApiResponse {
    Ok(ok(state.services.projects.get(user.id(), &id)?))
}

async fn update(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    JsonBody(update): JsonBody<ProjectUpdate>,
) -> ApiResponse {
    Ok(ok(state.services.projects.update(user.id(), &id, &update)?).message("Project updated"))
}

async fn delete(State(state): State<AppState>, user: AuthenticatedUser, Path(id): Path<String>) -> ApiResponse {
    let report = state.services.projects.delete(user.id(), &id)?;
    Ok(ok(report).message("Project deleted"))
}

async fn summary(State(state): State<AppState>, user: AuthenticatedUser, Path(id): Path<String>) -> ApiResponse {
    Ok(ok(state.services.projects.summary(user.id(), &id)?))
}

pub(super) async fn overview(State(state): State<AppState>, user: AuthenticatedUser) -> ApiResponse {
    Ok(ok(state.services.projects.overview(user.id())?))
}

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/{id}", get(get_one).put(update).patch(update).delete(delete))
        .route("/{id}/summary", get(summary))
}
