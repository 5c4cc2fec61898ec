//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    response::IntoResponse,
    routing::get,
};
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use super::admission::{Admission, with_admission};
use crate::cache::TtlCache;
use crate::config::ServerConfig;
use crate::security::SecurityGuard;

/// Shared application state
pub struct AppState {
    /// Response cache shared with the data-fetch wrappers
    pub cache: Arc<TtlCache<Value>>,
    /// Rate limiter and abuse guard
    pub guard: Arc<SecurityGuard>,
}

/// Create the router.
///
/// `GET /api/security/blocks` is mounted only with `server.expose_blocks`.
pub fn create_router(state: Arc<AppState>, server: &ServerConfig) -> Router {
    let admission = Admission::new(
        Arc::clone(&state.guard),
        server.trusted_proxies.iter().copied(),
    );

    let mut routes = Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/stats", get(stats_handler));
    if server.expose_blocks {
        routes = routes.route("/api/security/blocks", get(blocks_handler));
    }

    with_admission(routes, admission)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(CatchPanicLayer::new())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// GET /api/health
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /api/stats - cache and guard occupancy
async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "cache": state.cache.stats(),
        "security": state.guard.stats(),
    }))
}

/// GET /api/security/blocks - currently blocked clients
async fn blocks_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "blocked": state.guard.blocked_clients() }))
}
