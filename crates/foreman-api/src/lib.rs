#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **foreman-api** – Thin HTTP/WebSocket adapter over the Foreman control
//! plane (§6).
//!
//! Holds no control-plane logic of its own: every handler translates a
//! request into a call against [`foreman_queue`], [`foreman_store_core`],
//! [`foreman_sandbox`], or [`foreman_cost`], and serializes whatever comes
//! back. [`build_router`] wires the full route table; binaries are
//! expected to construct [`state::ApiState`], call [`build_router`], and
//! drive the resulting `Router` with `axum::serve`.

pub mod alerts;
pub mod commits;
pub mod health;
pub mod sandboxes;
pub mod state;
pub mod tasks;
pub mod tickets;
pub mod ws;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use foreman_queue::QueueError;
use foreman_store_core::StorageError;
use foreman_types::EntityId;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

pub use state::ApiState;

/// The OpenAPI document for the endpoints annotated with `#[utoipa::path]`.
/// Only the unauthenticated health probe carries a full schema; the rest
/// of the surface is intentionally left out of the generated document
/// until its request/response types are worth stabilizing as public API.
#[derive(OpenApi)]
#[openapi(paths(health::health), components(schemas(health::HealthResponse)))]
pub struct ApiDoc;

/// Errors a route handler can return, mapped onto an HTTP status by
/// [`IntoResponse`].
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request body failed validation.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// The referenced entity does not exist.
    #[error("not found")]
    NotFound,
    /// The request conflicts with current state (e.g. scheduling blocked).
    #[error("conflict: {0}")]
    Conflict(String),
    /// No sandbox gateway is configured for this deployment.
    #[error("sandbox gateway not configured")]
    SandboxUnavailable,
    /// The backing store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// An unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn from_queue(err: QueueError) -> Self {
        match err {
            QueueError::Storage(err) => ApiError::Storage(err),
            QueueError::TaskNotFound(_) => ApiError::NotFound,
            QueueError::SchedulingBlocked(id) => {
                ApiError::Conflict(format!("ticket {id} does not permit scheduling"))
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::SandboxUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Storage(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

fn parse_id(raw: &str) -> Result<EntityId, ApiError> {
    raw.parse::<uuid::Uuid>().map(EntityId::from).map_err(|_| ApiError::BadRequest(format!("invalid id: {raw}")))
}

/// Build the full route table over `state`, layered with request tracing.
pub fn build_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health::health))
        .route("/api/v1/tickets", post(tickets::create_ticket))
        .route("/api/v1/tickets/:id", get(tickets::get_ticket))
        .route("/api/v1/tickets/:id/approve", post(tickets::approve_ticket))
        .route("/api/v1/tickets/:id/reject", post(tickets::reject_ticket))
        .route("/api/v1/tasks", get(tasks::list_tasks).post(tasks::create_task))
        .route("/api/v1/tasks/:id", patch(tasks::patch_task))
        .route("/api/v1/sandboxes/spawn", post(sandboxes::spawn_sandbox))
        .route("/api/v1/sandboxes/:sandbox_id/events", get(sandboxes::sandbox_events))
        .route("/api/v1/sandboxes/:sandbox_id/messages", post(sandboxes::send_sandbox_message))
        .route("/api/v1/commits/:sha", get(commits::get_commit))
        .route("/api/v1/commits/ticket/:id", get(commits::list_commits_for_ticket))
        .route("/api/v1/commits/ticket/:id/link", post(commits::link_commit))
        .route("/api/v1/alerts", get(alerts::list_alerts))
        .route("/api/v1/alerts/:id/acknowledge", post(alerts::acknowledge_alert))
        .route("/api/v1/alerts/:id/resolve", post(alerts::resolve_alert))
        .route("/api/v1/ws/events", get(ws::ws_events))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_id_rejects_garbage() {
        assert!(matches!(parse_id("not-a-uuid"), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn parse_id_accepts_a_uuid() {
        let id = EntityId::new();
        assert_eq!(parse_id(&id.to_string()).unwrap(), id);
    }
}
