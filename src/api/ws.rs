//! Change notifications over WebSocket.
//!
//! Clients authenticate with `?token=` or an `Authorization` header, receive a
//! `connected` frame, then one `change` frame per event of their own. A text
//! frame `{"type":"ping"}` is answered with `{"type":"pong"}`.

use super::AppState;
use crate::auth::{User, extract_bearer_token};
use crate::error::ApiError;
use crate::notifications::ChangeEvent;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Deserialize)]
pub(super) struct WsQuery {
    #[serde(default)]
    token: Option<String>,
}

fn request_token(query: &WsQuery, headers: &HeaderMap) -> Option<String> {
    if let Some(ref token) = query.token
        && !token.is_empty()
    {
        return Some(token.clone());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
        .map(str::to_string)
}

pub(super) async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = request_token(&query, &headers) else {
        return ApiError::unauthorized("Missing token").into_response();
    };
    let user = match state.auth.authenticate(&token).await {
        Ok(user) => user,
        Err(e) => return e.into_response(),
    };
    let events = state.services.notifications.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, user, events))
}

fn frame(value: Value) -> Message {
    Message::Text(value.to_string().into())
}

fn is_ping(text: &str) -> bool {
    serde_json::from_str::<Value>(text)
        .map(|v| v.get("type").and_then(Value::as_str) == Some("ping"))
        .unwrap_or(false)
}

async fn handle_socket(socket: WebSocket, user: User, mut events: broadcast::Receiver<ChangeEvent>) {
    let (mut sender, mut receiver) = socket.split();
    info!(user_id = %user.id, "WebSocket connected");

    let connected = json!({
        "type": "connected",
        "user_id": user.id,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    if sender.send(frame(connected)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if event.user_id != user.id {
                        continue;
                    }
                    let message = frame(json!({ "type": "change", "event": event }));
                    if sender.send(message).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(user_id = %user.id, skipped, "WebSocket client lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if is_ping(text.as_str()) {
                        let pong = json!({ "type": "pong", "timestamp": chrono::Utc::now().to_rfc3339() });
                        if sender.send(frame(pong)).await.is_err() {
                            break;
                        }
                    } else {
                        debug!(user_id = %user.id, "Ignoring WebSocket message");
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(user_id = %user.id, error = %e, "WebSocket receive failed");
                    break;
                }
            },
        }
    }

    info!(user_id = %user.id, "WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_token_wins_over_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer from-header".parse().unwrap());
        let query = WsQuery {
            token: Some("from-query".into()),
        };
        assert_eq!(request_token(&query, &headers).as_deref(), Some("from-query"));

        let query = WsQuery { token: None };
        assert_eq!(request_token(&query, &headers).as_deref(), Some("from-header"));
        assert!(request_token(&query, &HeaderMap::new()).is_none());
    }

    #[test]
    fn recognizes_ping_frames() {
        assert!(is_ping(r#"{"type":"ping"}"#));
        assert!(!is_ping(r#"{"type":"hello"}"#));
        assert!(!is_ping("ping"));
    }
}
