use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;

use crate::build_info;
use crate::server::AppState;

pub async fn livez() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

#[derive(Serialize)]
pub struct ReadyzResponse {
    pub status: String,
    pub tenants: usize,
    pub monitored: usize,
}

pub async fn readyz(State(state): State<AppState>) -> Json<ReadyzResponse> {
    let tenants = state.bridge.tenants.tenant_ids().await.len();
    let monitored = state.bridge.supervisor.len().await;
    Json(ReadyzResponse {
        status: "ok".to_string(),
        tenants,
        monitored,
    })
}

#[derive(Serialize)]
pub struct VersionResponse {
    pub name: &'static str,
    pub version: &'static str,
}

pub async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        name: build_info::NAME,
        version: build_info::VERSION,
    })
}
