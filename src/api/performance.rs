use super::{ApiResponse, AppState, ok};
use crate::auth::AuthenticatedUser;
use axum::Router;
use axum::extract::State;
use axum::routing::{get, post};
use serde_json::json;

async fn metrics(State(state): State<AppState>, _user: AuthenticatedUser) -> ApiResponse {
    Ok(ok(state.services.metrics.snapshot()))
}

async fn reset_metrics(State(state): State<AppState>, _user: AuthenticatedUser) -> ApiResponse {
    state.services.metrics.reset();
    Ok(ok(json!({ "reset": true })).message("Metrics reset"))
}

async fn pool(State(state): State<AppState>, _user: AuthenticatedUser) -> ApiResponse {
    let db = &state.services.db;
    Ok(ok(json!({
        "pool": db.pool_stats(),
        "schema_version": db.schema_version()?,
    })))
}

async fn cache(State(state): State<AppState>, _user: AuthenticatedUser) -> ApiResponse {
    let inheritance = state.services.db.inheritance_cache_stats()?;
    Ok(ok(json!({
        "memory": state.services.cache.stats(),
        "inheritance": inheritance,
    })))
}

async fn notifications(State(state): State<AppState>, _user: AuthenticatedUser) -> ApiResponse {
    Ok(ok(state.services.notifications.stats()))
}

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/metrics/reset", post(reset_metrics))
        .route("/pool", get(pool))
        .route("/cache", get(cache))
        .route("/notifications", get(notifications))
}
