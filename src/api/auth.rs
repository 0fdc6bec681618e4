use super::{ApiResponse, AppState, JsonBody, created, ok};
use crate::auth::AuthenticatedUser;
use crate::error::ApiError;
use axum::Router;
use axum::extract::State;
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize)]
struct RegisterRequest {
    email: String,
    username: String,
    password: String,
}

/// `login` accepts an email or a username; `email`/`username` are aliases.
#[derive(Deserialize)]
struct LoginRequest {
    #[serde(default)]
    login: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    username: Option<String>,
    password: String,
}

#[derive(Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

#[derive(Deserialize)]
struct ChangePasswordRequest {
    current_password: String,
    new_password: String,
}

async fn register(State(state): State<AppState>, JsonBody(req): JsonBody<RegisterRequest>) -> ApiResponse {
    let user = state.auth.register(&req.email, &req.username, &req.password).await?;
    Ok(created(user).message("Registration successful"))
}

async fn login(State(state): State<AppState>, JsonBody(req): JsonBody<LoginRequest>) -> ApiResponse {
    let login = req
        .login
        .or(req.email)
        .or(req.username)
        .ok_or_else(|| ApiError::missing_field("login"))?;
    let response = state.auth.login(&login, &req.password).await?;
    Ok(ok(response))
}

async fn refresh(State(state): State<AppState>, JsonBody(req): JsonBody<RefreshRequest>) -> ApiResponse {
    let tokens = state.auth.refresh(&req.refresh_token).await?;
    Ok(ok(tokens))
}

async fn logout(State(state): State<AppState>, user: AuthenticatedUser) -> ApiResponse {
    state.auth.logout(&user.0)?;
    Ok(ok(json!({ "logged_out": true })).message("Refresh tokens revoked"))
}

async fn me(State(state): State<AppState>, user: AuthenticatedUser) -> ApiResponse {
    Ok(ok(state.auth.me(user.id())?))
}

async fn change_password(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    JsonBody(req): JsonBody<ChangePasswordRequest>,
) -> ApiResponse {
    let current = state.auth.me(user.id())?;
    state
        .auth
        .change_password(&current, &req.current_password, &req.new_password)
        .await?;
    Ok(ok(json!({ "changed": true })).message("Password changed; please log in again"))
}

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/refresh", post(refresh))
        .route("/logout", post(logout))
        .route("/me", get(me))
        .route("/change-password", post(change_password))
}
