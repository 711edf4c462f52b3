//! Per-tenant monitoring, pairing and operator-command handlers.

use axum::Json;
use axum::extract::{Path as PathExtract, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::handlers::problem_details::{self, ProblemDetails};
use crate::reliability::EpisodeStatus;
use crate::server::AppState;
use crate::tenant::{TenantError, TenantRecord};

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct MonitorResponse {
    pub tenant_id: String,
    pub monitoring: bool,
    #[serde(flatten)]
    pub episode: Option<EpisodeStatus>,
}

#[derive(Debug, Serialize)]
pub struct StartMonitorResponse {
    pub tenant_id: String,
    pub monitoring: bool,
    /// False when a monitor was already running.
    pub started: bool,
}

#[derive(Debug, Deserialize)]
pub struct PairingRequest {
    pub conversation_id: u64,
}

#[derive(Debug, Serialize)]
pub struct PairingResponse {
    pub tenant_id: String,
    pub episode_id: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub conversation_id: u64,
    pub expires_in_seconds: u64,
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub conversation_id: u64,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub handled: bool,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub removed: usize,
}

/// Look up a tenant, turning failures into the matching problem response.
async fn require_tenant(
    state: &AppState,
    tenant_id: &str,
) -> Result<TenantRecord, Response> {
    match state.bridge.tenants.get(tenant_id).await {
        Ok(tenant) => Ok(tenant),
        Err(TenantError::NotFound(_)) => Err(problem_details::not_found(format!(
            "tenant '{tenant_id}' not found"
        ))
        .into_response()),
        Err(e) => {
            error!(tenant = %tenant_id, error = %e, "Tenant lookup failed");
            Err(problem_details::internal_error("tenant lookup failed").into_response())
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/v1/tenants/{tenant}/monitor
pub async fn get_monitor(
    State(state): State<AppState>,
    PathExtract(tenant_id): PathExtract<String>,
) -> Response {
    if let Err(response) = require_tenant(&state, &tenant_id).await {
        return response;
    }

    let episode = state.bridge.supervisor.status(&tenant_id).await;
    Json(MonitorResponse {
        monitoring: episode.is_some(),
        tenant_id,
        episode,
    })
    .into_response()
}

/// POST /api/v1/tenants/{tenant}/monitor
pub async fn start_monitor(
    State(state): State<AppState>,
    PathExtract(tenant_id): PathExtract<String>,
) -> Response {
    if let Err(response) = require_tenant(&state, &tenant_id).await {
        return response;
    }

    let started = state.bridge.ensure_monitoring(&tenant_id).await;
    if started {
        info!(tenant = %tenant_id, "Monitoring requested over API");
    }
    (
        StatusCode::ACCEPTED,
        Json(StartMonitorResponse {
            tenant_id,
            monitoring: true,
            started,
        }),
    )
        .into_response()
}

/// DELETE /api/v1/tenants/{tenant}/monitor
pub async fn stop_monitor(
    State(state): State<AppState>,
    PathExtract(tenant_id): PathExtract<String>,
) -> Response {
    if let Err(response) = require_tenant(&state, &tenant_id).await {
        return response;
    }

    state.bridge.stop_monitoring(&tenant_id).await;
    StatusCode::NO_CONTENT.into_response()
}

/// POST /api/v1/tenants/{tenant}/pairing
pub async fn start_pairing(
    State(state): State<AppState>,
    PathExtract(tenant_id): PathExtract<String>,
    Json(req): Json<PairingRequest>,
) -> Response {
    let tenant = match require_tenant(&state, &tenant_id).await {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };

    match state
        .bridge
        .request_pairing(&tenant_id, req.conversation_id, &tenant.console)
        .await
    {
        Ok(attempt) => {
            let response = PairingResponse {
                tenant_id,
                episode_id: attempt.id.episode.to_string(),
                attempt: attempt.number(),
                max_attempts: state.bridge.supervisor.timings().max_pairing_attempts,
                conversation_id: attempt.conversation_id,
                expires_in_seconds: attempt
                    .expires_at
                    .saturating_duration_since(Instant::now())
                    .as_secs(),
            };
            (StatusCode::ACCEPTED, Json(response)).into_response()
        }
        Err(e) => {
            debug!(tenant = %tenant_id, error = %e, "Pairing request refused");
            ProblemDetails::from(e).into_response()
        }
    }
}

/// POST /api/v1/tenants/{tenant}/commands
pub async fn run_command(
    State(state): State<AppState>,
    PathExtract(tenant_id): PathExtract<String>,
    Json(req): Json<CommandRequest>,
) -> Response {
    if let Err(response) = require_tenant(&state, &tenant_id).await {
        return response;
    }

    let handled = state
        .bridge
        .handle_command(&tenant_id, req.conversation_id, &req.text)
        .await;
    Json(CommandResponse { handled }).into_response()
}

/// DELETE /api/v1/tenants/{tenant}/cache
pub async fn invalidate_cache(
    State(state): State<AppState>,
    PathExtract(tenant_id): PathExtract<String>,
) -> Response {
    if let Err(response) = require_tenant(&state, &tenant_id).await {
        return response;
    }

    let removed = state.bridge.invalidate_tenant(&tenant_id);
    info!(tenant = %tenant_id, removed, "Tenant cache invalidated");
    Json(InvalidateResponse { removed }).into_response()
}
