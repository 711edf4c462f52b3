use std::time::Duration;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::bridge::Bridge;
use crate::handlers;

// ============================================================================
// Application State
// ============================================================================

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub bridge: Bridge,
    pub api_token: Option<String>,
    pub max_connections: usize,
}

// ============================================================================
// Server Setup
// ============================================================================

pub fn build_app(state: AppState, request_timeout_seconds: u64) -> Router {
    let max_connections = state.max_connections;

    let tenant_routes = Router::new()
        .route(
            "/tenants/{tenant}/monitor",
            get(handlers::v1::get_monitor)
                .post(handlers::v1::start_monitor)
                .delete(handlers::v1::stop_monitor),
        )
        .route("/tenants/{tenant}/pairing", post(handlers::v1::start_pairing))
        .route("/tenants/{tenant}/cache", delete(handlers::v1::invalidate_cache))
        .route("/tenants/{tenant}/commands", post(handlers::v1::run_command))
        .route("/tenants/{tenant}/inbound", post(handlers::v1::forward_inbound))
        .route(
            "/tenants/{tenant}/outbound",
            post(handlers::v1::forward_outbound),
        )
        .with_state(state.clone())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(request_timeout_seconds),
        ));

    let api_v1 = tenant_routes
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024)) // 2 MB
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            handlers::api_auth::require_api_token,
        ))
        .layer(ConcurrencyLimitLayer::new(max_connections));

    Router::new()
        .route("/livez", get(handlers::livez))
        .route("/readyz", get(handlers::readyz))
        .route("/version", get(handlers::version))
        .with_state(state)
        .nest("/api/v1", api_v1)
}
