//! `/api/v1/alerts` (§6).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use foreman_cost::alerting::Alert;
use serde::Deserialize;

use crate::state::ApiState;
use crate::ApiError;

/// `GET /api/v1/alerts`.
pub async fn list_alerts(State(state): State<Arc<ApiState>>) -> Json<Vec<Alert>> {
    Json(state.alerts.active_alerts())
}

/// Body for `POST /api/v1/alerts/{id}/acknowledge`.
#[derive(Debug, Deserialize)]
pub struct AcknowledgeRequest {
    /// Who is acknowledging the alert.
    pub acknowledged_by: String,
}

/// `POST /api/v1/alerts/{id}/acknowledge`.
pub async fn acknowledge_alert(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(body): Json<AcknowledgeRequest>,
) -> Result<Json<Alert>, ApiError> {
    let id = crate::parse_id(&id)?;
    let alert = state
        .alerts
        .acknowledge_alert(id, body.acknowledged_by)
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    Ok(Json(alert))
}

/// Body for `POST /api/v1/alerts/{id}/resolve`.
#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    /// Who is resolving the alert.
    pub resolved_by: String,
    /// Optional free-text resolution note.
    pub note: Option<String>,
}

/// `POST /api/v1/alerts/{id}/resolve`.
pub async fn resolve_alert(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(body): Json<ResolveRequest>,
) -> Result<Json<Alert>, ApiError> {
    let id = crate::parse_id(&id)?;
    let alert = state
        .alerts
        .resolve_alert(id, body.resolved_by, body.note)
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    Ok(Json(alert))
}
