//! HTTP server implementation using Axum.

use crate::handler::{handle_health, handle_pull, handle_push, Authenticator};
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tether_core::ServerEngine;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Application state shared across handlers.
pub struct AppState {
    /// The RPC engine backing both endpoints.
    pub engine: ServerEngine,
    /// Resolves requests to client ids.
    pub authenticator: Authenticator,
}

/// Build the router serving the wire protocol plus a health endpoint.
pub fn build_router(state: Arc<AppState>) -> Router {
    // Permissive CORS so browser-hosted clients can long-poll during
    // development.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/push", post(handle_push))
        .route("/pull", post(handle_pull))
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP host.
///
/// Returns the actual address the server is bound to (useful when
/// port=0).
pub async fn start_server(
    engine: ServerEngine,
    authenticator: Authenticator,
    host: &str,
    port: u16,
) -> anyhow::Result<SocketAddr> {
    let state = Arc::new(AppState {
        engine,
        authenticator,
    });
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("server listening on {}", actual_addr);

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server error");
    });

    Ok(actual_addr)
}
