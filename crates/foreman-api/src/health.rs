//! `/api/v1/health` (§6): unauthenticated liveness probe.

use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

/// Health-check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Always `"healthy"` if the process is serving requests at all.
    pub status: &'static str,
    /// The running crate version.
    pub version: &'static str,
}

/// `GET /api/v1/health`.
#[utoipa::path(get, path = "/api/v1/health", responses((status = 200, body = HealthResponse)))]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy", version: env!("CARGO_PKG_VERSION") })
}
