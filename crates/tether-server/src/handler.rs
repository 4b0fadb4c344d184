//! Endpoint handlers for the two wire endpoints.
//!
//! The engine core stays HTTP-agnostic; this module does the status-code
//! mapping: 401 when the authenticator cannot resolve a client id, 400
//! for malformed bodies, empty 2xx for an idle long poll.

use crate::server::AppState;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use tether_core::{Result, RpcCommand, RpcCommandResult, RpcHandler, CLIENT_ID_HEADER};
use tracing::{debug, warn};

/// Resolves an HTTP request to a client id, or `None` to reject it.
pub type Authenticator = Arc<dyn Fn(&HeaderMap) -> Option<String> + Send + Sync>;

/// The default authenticator: trust the client id carried in the
/// `x-tether-client` header. Production hosts replace this with something
/// that verifies real credentials.
pub fn header_authenticator() -> Authenticator {
    Arc::new(|headers: &HeaderMap| {
        headers
            .get(CLIENT_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|id| !id.is_empty())
            .map(String::from)
    })
}

/// Health check endpoint.
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// `POST /push` — execute one client-originated command.
pub async fn handle_push(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(client_id) = (state.authenticator)(&headers) else {
        warn!("push rejected: unauthenticated");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let command: RpcCommand = match serde_json::from_slice(&body) {
        Ok(command) => command,
        Err(e) => {
            warn!(client_id = %client_id, error = %e, "push rejected: malformed command");
            return (StatusCode::BAD_REQUEST, format!("malformed command: {e}")).into_response();
        }
    };

    let result = state.engine.handle_push(&client_id, command).await;
    Json(result).into_response()
}

/// `POST /pull` — accept the previous result (if any) and long-poll for
/// the next command.
pub async fn handle_pull(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(client_id) = (state.authenticator)(&headers) else {
        warn!("pull rejected: unauthenticated");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let previous = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice::<RpcCommandResult>(&body) {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "pull rejected: malformed result report");
                return (StatusCode::BAD_REQUEST, format!("malformed result: {e}"))
                    .into_response();
            }
        }
    };

    match state.engine.handle_pull(&client_id, previous).await {
        Some(command) => Json(command).into_response(),
        None => {
            debug!(client_id = %client_id, "long poll idle");
            StatusCode::OK.into_response()
        }
    }
}

/// Built-in host method: `Echo` returns its first argument. Lets a client
/// verify the full round trip without any application handlers installed.
pub struct EchoHandler;

#[async_trait::async_trait]
impl RpcHandler for EchoHandler {
    async fn execute(&self, command: &RpcCommand) -> Option<Result<serde_json::Value>> {
        (command.method_name == "Echo").then(|| {
            Ok(command
                .parameter(0)
                .cloned()
                .unwrap_or(serde_json::Value::Null))
        })
    }
}
