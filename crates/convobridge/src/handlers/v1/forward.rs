//! Gated forwarding handlers for events the ingestion layer already parsed.

use axum::Json;
use axum::extract::{Path as PathExtract, State};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::warn;

use crate::forward::{ForwardOutcome, InboundEvent, OutboundEvent};
use crate::handlers::problem_details::ProblemDetails;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct ForwardResponse {
    pub forwarded: bool,
    #[serde(flatten)]
    pub outcome: ForwardOutcome,
}

impl From<ForwardOutcome> for ForwardResponse {
    fn from(outcome: ForwardOutcome) -> Self {
        Self {
            forwarded: outcome.forwarded(),
            outcome,
        }
    }
}

/// POST /api/v1/tenants/{tenant}/inbound
pub async fn forward_inbound(
    State(state): State<AppState>,
    PathExtract(tenant_id): PathExtract<String>,
    Json(event): Json<InboundEvent>,
) -> Response {
    match state.bridge.forwarder.forward_inbound(&tenant_id, &event).await {
        Ok(outcome) => Json(ForwardResponse::from(outcome)).into_response(),
        Err(e) => {
            warn!(tenant = %tenant_id, event_id = %event.event_id, error = %e, "Inbound forward failed");
            ProblemDetails::from(e).into_response()
        }
    }
}

/// POST /api/v1/tenants/{tenant}/outbound
pub async fn forward_outbound(
    State(state): State<AppState>,
    PathExtract(tenant_id): PathExtract<String>,
    Json(event): Json<OutboundEvent>,
) -> Response {
    match state.bridge.forwarder.forward_outbound(&tenant_id, &event).await {
        Ok(outcome) => Json(ForwardResponse::from(outcome)).into_response(),
        Err(e) => {
            warn!(tenant = %tenant_id, message_id = %event.message_id, error = %e, "Outbound forward failed");
            ProblemDetails::from(e).into_response()
        }
    }
}
