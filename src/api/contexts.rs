//! Context and delegation routes.
//!
//! Contexts are addressed as `/{level}/{id}` where `level` is one of
//! `global`, `project`, `branch` or `task`. The global context of the caller
//! is reachable as `/global/global`.

use super::{ApiResponse, AppState, JsonBody, OptionalJson, Page, QueryParams, created, ok};
use crate::auth::AuthenticatedUser;
use crate::context::{ContextLevel, ContextUpdate, DelegationStatus};
use crate::error::{ApiError, ApiResult};
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};

fn parse_level(level: &str) -> ApiResult<ContextLevel> {
    level
        .parse()
        .map_err(|reason: String| ApiError::invalid_value("level", reason))
}

#[derive(Deserialize)]
struct CreateContext {
    context_id: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Deserialize)]
struct ResolveQuery {
    #[serde(default)]
    force_refresh: bool,
}

#[derive(Deserialize)]
struct DelegateRequest {
    target_level: String,
    data: Value,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct InsightRequest {
    content: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    importance: Option<String>,
}

#[derive(Deserialize)]
struct ProgressRequest {
    content: String,
    #[serde(default)]
    agent: Option<String>,
}

#[derive(Deserialize, Default)]
struct InvalidateRequest {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct ListDelegations {
    #[serde(default)]
    status: Option<DelegationStatus>,
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct ProcessRequest {
    approve: bool,
}

async fn list(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(level): Path<String>,
    QueryParams(page): QueryParams<Page>,
) -> ApiResponse {
    let level = parse_level(&level)?;
    let contexts = state
        .services
        .contexts
        .list(user.id(), level, page.limit(), page.offset())?;
    Ok(ok(json!({ "contexts": contexts, "count": contexts.len() })))
}

async fn create(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(level): Path<String>,
    JsonBody(req): JsonBody<CreateContext>,
) -> ApiResponse {
    let level = parse_level(&level)?;
    let result = state
        .services
        .contexts
        .create(user.id(), level, &req.context_id, req.data)?;
    Ok(created(result).message(format!("{} context created", level)))
}

async fn get_one(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((level, id)): Path<(String, String)>,
) -> ApiResponse {
    let level = parse_level(&level)?;
    Ok(ok(state.services.contexts.get(user.id(), level, &id)?))
}

async fn update(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((level, id)): Path<(String, String)>,
    JsonBody(update): JsonBody<ContextUpdate>,
) -> ApiResponse {
    let level = parse_level(&level)?;
    let context = state.services.contexts.update(user.id(), level, &id, update)?;
    Ok(ok(context).message("Context updated"))
}

async fn delete(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((level, id)): Path<(String, String)>,
) -> ApiResponse {
    let level = parse_level(&level)?;
    state.services.contexts.delete(user.id(), level, &id)?;
    Ok(ok(json!({ "level": level, "context_id": id })).message("Context deleted"))
}

async fn resolve(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((level, id)): Path<(String, String)>,
    QueryParams(query): QueryParams<ResolveQuery>,
) -> ApiResponse {
    let level = parse_level(&level)?;
    let resolved = state
        .services
        .contexts
        .resolve(user.id(), level, &id, query.force_refresh)?;
    Ok(ok(resolved))
}

async fn delegate(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((level, id)): Path<(String, String)>,
    JsonBody(req): JsonBody<DelegateRequest>,
) -> ApiResponse {
    let from_level = parse_level(&level)?;
    let to_level = parse_level(&req.target_level)?;
    let delegation = state.services.contexts.delegate(
        user.id(),
        from_level,
        &id,
        to_level,
        req.data,
        req.reason.as_deref().unwrap_or(""),
    )?;
    Ok(created(delegation).message("Delegation queued"))
}

async fn add_insight(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((level, id)): Path<(String, String)>,
    JsonBody(req): JsonBody<InsightRequest>,
) -> ApiResponse {
    let level = parse_level(&level)?;
    let context = state.services.contexts.add_insight(
        user.id(),
        level,
        &id,
        &req.content,
        req.category.as_deref(),
        req.importance.as_deref(),
    )?;
    Ok(ok(context).message("Insight added"))
}

async fn add_progress(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((level, id)): Path<(String, String)>,
    JsonBody(req): JsonBody<ProgressRequest>,
) -> ApiResponse {
    let level = parse_level(&level)?;
    let context = state.services.contexts.add_progress(
        user.id(),
        level,
        &id,
        &req.content,
        req.agent.as_deref(),
    )?;
    Ok(ok(context).message("Progress added"))
}

async fn validate(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((level, id)): Path<(String, String)>,
) -> ApiResponse {
    let level = parse_level(&level)?;
    Ok(ok(state.services.contexts.validate(user.id(), level, &id)?))
}

async fn invalidate(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((level, id)): Path<(String, String)>,
    OptionalJson(req): OptionalJson<InvalidateRequest>,
) -> ApiResponse {
    let level = parse_level(&level)?;
    let reason = req.reason.as_deref().unwrap_or("manual");
    let invalidated = state
        .services
        .contexts
        .invalidate(user.id(), level, &id, reason)?;
    Ok(ok(json!({ "invalidated": invalidated })))
}

pub(super) fn context_routes() -> Router<AppState> {
    Router::new()
        .route("/{level}", get(list).post(create))
        .route("/{level}/{id}", get(get_one).put(update).patch(update).delete(delete))
        .route("/{level}/{id}/resolve", get(resolve))
        .route("/{level}/{id}/delegate", post(delegate))
        .route("/{level}/{id}/insights", post(add_insight))
        .route("/{level}/{id}/progress", post(add_progress))
        .route("/{level}/{id}/validate", get(validate))
        .route("/{level}/{id}/invalidate", post(invalidate))
}

async fn list_delegations(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    QueryParams(query): QueryParams<ListDelegations>,
) -> ApiResponse {
    let limit = crate::types::clamp_limit(query.limit);
    let delegations = state
        .services
        .contexts
        .list_delegations(user.id(), query.status, limit)?;
    Ok(ok(json!({ "delegations": delegations, "count": delegations.len() })))
}

async fn get_delegation(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> ApiResponse {
    Ok(ok(state.services.contexts.get_delegation(user.id(), &id)?))
}

async fn process_delegation(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<ProcessRequest>,
) -> ApiResponse {
    let delegation = state
        .services
        .contexts
        .process_delegation(user.id(), &id, req.approve)?;
    let message = if req.approve {
        "Delegation approved"
    } else {
        "Delegation rejected"
    };
    Ok(ok(delegation).message(message))
}

pub(super) fn delegation_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_delegations))
        .route("/{id}", get(get_delegation))
        .route("/{id}/process", post(process_delegation))
}
