//! presenced — page-scoped peer presence over WebSocket.
//!
//! Sessions that connect with the same `page` key discover each other:
//! each receives an arrival event per active peer and, eventually, a
//! departure event when that peer goes away. No central directory; the
//! sessions reconcile through a shared broadcast group.

mod broker;
mod config;
mod error;
mod identity;
mod presence;
mod state;
mod types;
mod ws;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

#[tokio::main]
async fn main() {
    // Load .env if present (local dev).
    let _ = dotenvy::dotenv();

    let config = config::Config::from_env();

    // Tracing.
    tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .with_target(true)
        .init();

    info!("presenced starting");
    info!(listen = %config.listen_addr, instance = %config.server_instance);

    // ── Shared state ────────────────────────────────────────
    let listen_addr = config.listen_addr.clone();
    let state = state::AppState::new(config);

    // ── Routes ──────────────────────────────────────────────
    let app = Router::new()
        // WebSocket endpoint: /presence?page=<key>
        .route("/presence", get(ws::presence_handler))
        // Health check (useful for K8s liveness probes).
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // ── Bind & serve ────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .expect("failed to bind");

    info!(addr = %listen_addr, "presenced listening");

    axum::serve(listener, app)
        .await
        .expect("server error");
}

/// Liveness probe.
async fn healthz() -> &'static str {
    "ok"
}
