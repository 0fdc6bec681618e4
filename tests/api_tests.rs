//! HTTP API tests driven through the router without binding a socket.

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use std::sync::Arc;
use taskhub_server::api::{AppState, build_router};
use taskhub_server::auth::AuthService;
use taskhub_server::config::Config;
use taskhub_server::services::Services;
use tower::ServiceExt;

fn app() -> Router {
    let services = Services::in_memory().expect("Failed to create services");
    let mut config = Config::default();
    config.auth.jwt_secret_key = Some("0123456789abcdef0123".into());
    let auth = AuthService::new(&config.auth, services.db.clone()).expect("auth service");
    build_router(AppState::new(services, Arc::new(auth)), &[])
}

async fn send(app: &Router, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

/// Register and log in, returning the access token.
async fn login(app: &Router, username: &str) -> String {
    let (status, body) = send(
        app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({
            "email": format!("{}@example.com", username),
            "username": username,
            "password": "hunter2hunter2",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);

    let (status, body) = send(
        app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({ "login": username, "password": "hunter2hunter2" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    body["data"]["access_token"].as_str().unwrap().to_string()
}

mod auth_tests {
    use super::*;

    #[tokio::test]
    async fn health_reports_database_and_cache() {
        let app = app();
        let (status, body) = send(&app, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["database"], "ok");
        assert_eq!(body["cache"], "memory");
    }

    #[tokio::test]
    async fn protected_routes_require_a_token() {
        let app = app();
        let (status, body) = send(&app, "GET", "/api/v2/projects", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "UNAUTHORIZED");

        let (status, _) = send(&app, "GET", "/api/v2/projects", Some("not-a-jwt"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let app = app();
        login(&app, "casey").await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/auth/register",
            None,
            Some(json!({
                "email": "casey@example.com",
                "username": "casey2",
                "password": "hunter2hunter2",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "ALREADY_EXISTS");
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let app = app();
        login(&app, "casey").await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/auth/login",
            None,
            Some(json!({ "login": "casey", "password": "wrong-pass-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "INVALID_CREDENTIALS");
    }

    #[tokio::test]
    async fn me_returns_the_caller_without_secrets() {
        let app = app();
        let token = login(&app, "casey").await;
        let (status, body) = send(&app, "GET", "/api/auth/me", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["username"], "casey");
        assert!(body["data"].get("password_hash").is_none());
    }
}

mod resource_tests {
    use super::*;

    #[tokio::test]
    async fn project_branch_task_lifecycle() {
        let app = app();
        let token = login(&app, "casey").await;
        let token = Some(token.as_str());

        let (status, body) = send(&app, "POST", "/api/v2/projects", token, Some(json!({ "name": "alpha" }))).await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        assert_eq!(body["message"], "Project created");
        let project_id = body["data"]["id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            "POST",
            "/api/v2/branches",
            token,
            Some(json!({ "project_id": project_id, "name": "feature/login" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        let branch_id = body["data"]["id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            "POST",
            "/api/v2/tasks",
            token,
            Some(json!({ "branch_id": branch_id, "title": "write handler" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        let task_id = body["data"]["id"].as_str().unwrap().to_string();

        let (status, body) = send(&app, "GET", "/api/v2/tasks/next", token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["task"]["id"], task_id.as_str());

        let (status, body) = send(&app, "POST", &format!("/api/v2/tasks/{}/complete", task_id), token, None).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["data"]["status"], "done");

        let (status, body) = send(&app, "GET", "/api/v2/tasks/next", token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"]["task"].is_null());
        assert_eq!(body["message"], "No actionable tasks");

        let (status, body) = send(&app, "GET", "/api/v2/projects", token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["count"], 1);

        let (status, body) = send(&app, "DELETE", &format!("/api/v2/projects/{}", project_id), token, None).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["data"]["tasks"], 1);

        let (status, body) = send(&app, "GET", &format!("/api/v2/tasks/{}", task_id), token, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "TASK_NOT_FOUND");
    }

    #[tokio::test]
    async fn users_cannot_see_each_others_projects() {
        let app = app();
        let alice = login(&app, "alice").await;
        let bob = login(&app, "bob").await;

        let (_, body) = send(&app, "POST", "/api/v2/projects", Some(&alice), Some(json!({ "name": "private" }))).await;
        let project_id = body["data"]["id"].as_str().unwrap().to_string();

        let (status, body) = send(&app, "GET", &format!("/api/v2/projects/{}", project_id), Some(&bob), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "PROJECT_NOT_FOUND");

        let (_, body) = send(&app, "GET", "/api/v2/projects", Some(&bob), None).await;
        assert_eq!(body["data"]["count"], 0);
    }

    #[tokio::test]
    async fn malformed_bodies_use_the_error_envelope() {
        let app = app();
        let token = login(&app, "casey").await;
        let (status, body) = send(&app, "POST", "/api/v2/projects", Some(&token), Some(json!({ "title": "x" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "INVALID_FIELD_VALUE");
        assert_eq!(body["field"], "body");
    }
}

mod context_tests {
    use super::*;

    #[tokio::test]
    async fn task_context_resolves_through_the_hierarchy() {
        let app = app();
        let token = login(&app, "casey").await;
        let token = Some(token.as_str());

        let (_, body) = send(&app, "POST", "/api/v2/projects", token, Some(json!({ "name": "alpha" }))).await;
        let project_id = body["data"]["id"].as_str().unwrap().to_string();
        let (_, body) = send(
            &app,
            "POST",
            "/api/v2/branches",
            token,
            Some(json!({ "project_id": project_id, "name": "main" })),
        )
        .await;
        let branch_id = body["data"]["id"].as_str().unwrap().to_string();
        let (_, body) = send(
            &app,
            "POST",
            "/api/v2/tasks",
            token,
            Some(json!({ "branch_id": branch_id, "title": "t" })),
        )
        .await;
        let task_id = body["data"]["id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            "POST",
            "/api/v2/contexts/project",
            token,
            Some(json!({ "context_id": project_id, "data": { "style": "strict" } })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);

        let (status, body) = send(
            &app,
            "POST",
            "/api/v2/contexts/task",
            token,
            Some(json!({ "context_id": task_id })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);

        let (status, body) = send(
            &app,
            "GET",
            &format!("/api/v2/contexts/task/{}/resolve", task_id),
            token,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["data"]["resolved"]["style"], "strict");
    }

    #[tokio::test]
    async fn unknown_level_is_a_field_error() {
        let app = app();
        let token = login(&app, "casey").await;
        let (status, body) = send(&app, "GET", "/api/v2/contexts/galaxy/x", Some(&token), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "level");
    }
}

mod performance_tests {
    use super::*;

    #[tokio::test]
    async fn metrics_are_keyed_by_matched_route() {
        let app = app();
        let token = login(&app, "casey").await;
        send(&app, "GET", "/api/v2/projects/missing", Some(&token), None).await;

        let (status, body) = send(&app, "GET", "/api/v1/performance/metrics", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        let route = &body["data"]["routes"]["GET /api/v2/projects/{id}"];
        assert_eq!(route["requests"], 1);
        assert_eq!(route["errors"], 1);
    }
}
