//! REST and WebSocket interface.
//!
//! Routes live under `/api/auth`, `/api/v2` and `/api/v1/performance`, plus
//! `/health` and `/ws`. Successful responses use the envelope
//! `{ "success": true, "data": ..., "message"? }`; errors use the body built by
//! [`ApiError`].

mod auth;
mod branches;
mod contexts;
mod performance;
mod projects;
mod tasks;
mod ws;

use crate::auth::AuthService;
use crate::error::ApiError;
use crate::services::{Services, track_metrics};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRef, FromRequest, FromRequestParts, Request, State};
use axum::body::Bytes;
use axum::http::request::Parts;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router, middleware};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub auth: Arc<AuthService>,
}

impl AppState {
    pub fn new(services: Services, auth: Arc<AuthService>) -> Self {
        Self { services, auth }
    }
}

impl FromRef<AppState> for Arc<AuthService> {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

/// Success response: `{ "success": true, "data": ..., "message"? }`.
pub struct Envelope {
    status: StatusCode,
    data: Value,
    message: Option<String>,
}

impl Envelope {
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

fn envelope(status: StatusCode, data: impl Serialize) -> Envelope {
    Envelope {
        status,
        data: serde_json::to_value(data).unwrap_or(Value::Null),
        message: None,
    }
}

pub fn ok(data: impl Serialize) -> Envelope {
    envelope(StatusCode::OK, data)
}

pub fn created(data: impl Serialize) -> Envelope {
    envelope(StatusCode::CREATED, data)
}

impl IntoResponse for Envelope {
    fn into_response(self) -> Response {
        let mut body = json!({ "success": true, "data": self.data });
        if let Some(message) = self.message {
            body["message"] = json!(message);
        }
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResponse = Result<Envelope, ApiError>;

/// JSON body extractor that reports malformed input in the error envelope.
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(JsonBody(value)),
            Err(rejection) => Err(json_rejection(rejection)),
        }
    }
}

fn json_rejection(rejection: JsonRejection) -> ApiError {
    ApiError::invalid_value("body", rejection.body_text())
}

/// JSON body that may be omitted entirely; an empty body yields `T::default()`.
pub struct OptionalJson<T>(pub T);

impl<S, T> FromRequest<S> for OptionalJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Default,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::invalid_value("body", e.body_text()))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(OptionalJson(T::default()));
        }
        serde_json::from_slice(&bytes)
            .map(OptionalJson)
            .map_err(|e| ApiError::invalid_value("body", e.to_string()))
    }
}

/// Query-string extractor that reports malformed input in the error envelope.
pub struct QueryParams<T>(pub T);

impl<S, T> FromRequestParts<S> for QueryParams<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match axum::extract::Query::<T>::from_request_parts(parts, state).await {
            Ok(axum::extract::Query(value)) => Ok(QueryParams(value)),
            Err(rejection) => Err(query_rejection(rejection)),
        }
    }
}

fn query_rejection(rejection: QueryRejection) -> ApiError {
    ApiError::invalid_value("query", rejection.body_text())
}

/// Pagination query shared by list endpoints.
#[derive(Debug, Default, serde::Deserialize)]
pub struct Page {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Page {
    pub fn limit(&self) -> i64 {
        crate::types::clamp_limit(self.limit)
    }

    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    database: &'static str,
    cache: &'static str,
}

async fn health(State(state): State<AppState>) -> Response {
    let db_ok = state.services.db.ping().is_ok();
    let body = HealthResponse {
        status: if db_ok { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        database: if db_ok { "ok" } else { "unavailable" },
        cache: state.services.cache.backend_name(),
    };
    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(parsed)
}

/// Build the router with all routes.
pub fn build_router(state: AppState, cors_origins: &[String]) -> Router {
    let metrics = state.services.metrics.clone();

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::ws_handler))
        .nest("/api/auth", auth::routes())
        .route("/api/v2/overview", get(projects::overview))
        .nest("/api/v2/projects", projects::routes())
        .nest("/api/v2/branches", branches::routes())
        .nest("/api/v2/tasks", tasks::routes())
        .nest("/api/v2/contexts", contexts::context_routes())
        .nest("/api/v2/delegations", contexts::delegation_routes())
        .nest("/api/v1/performance", performance::routes())
        .route_layer(middleware::from_fn_with_state(metrics, track_metrics))
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A running HTTP server.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

/// Bind and serve in the background.
pub async fn start_server(
    state: AppState,
    host: &str,
    port: u16,
    cors_origins: &[String],
) -> anyhow::Result<ServerHandle> {
    let app = build_router(state, cors_origins);
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    let addr = listener.local_addr()?;
    info!("API server listening on http://{}", addr);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                info!("API server shutting down");
            })
            .await
        {
            error!("API server error: {}", e);
        }
    });

    Ok(ServerHandle {
        addr,
        shutdown_tx: Some(shutdown_tx),
        task,
    })
}
