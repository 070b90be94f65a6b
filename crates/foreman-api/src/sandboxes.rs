//! `/api/v1/sandboxes` (§6).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use foreman_bus::SystemEvent;
use foreman_sandbox::{ExecutionMode, MessageType, SpawnRequest};
use foreman_types::EntityId;
use serde::{Deserialize, Serialize};

use crate::state::ApiState;
use crate::ApiError;

/// Body for `POST /api/v1/sandboxes/spawn`.
#[derive(Debug, Deserialize)]
pub struct SpawnSandboxRequest {
    /// The task to execute.
    pub task_id: EntityId,
    /// The agent bound to the sandbox.
    pub agent_id: EntityId,
    /// Implementation phase tag.
    pub phase_id: String,
    /// Agent template tag.
    pub agent_type: String,
    /// Runtime override.
    pub runtime: Option<String>,
    /// Additional environment variables.
    pub extra_env: Option<std::collections::HashMap<String, String>>,
}

/// Response for `POST /api/v1/sandboxes/spawn`.
#[derive(Debug, Serialize)]
pub struct SpawnSandboxResponse {
    /// The spawned sandbox's identifier.
    pub sandbox_id: String,
}

/// `POST /api/v1/sandboxes/spawn`.
pub async fn spawn_sandbox(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<SpawnSandboxRequest>,
) -> Result<Json<SpawnSandboxResponse>, ApiError> {
    let sandbox = state.sandbox.as_ref().ok_or(ApiError::SandboxUnavailable)?;
    let request = SpawnRequest {
        task_id: body.task_id,
        agent_id: body.agent_id,
        phase_id: body.phase_id,
        agent_type: body.agent_type,
        extra_env: body.extra_env,
        runtime: body.runtime,
        execution_mode: Some(ExecutionMode::Container),
    };
    let sandbox_id = sandbox.spawn_for_task(request).await.map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok(Json(SpawnSandboxResponse { sandbox_id }))
}

/// `GET /api/v1/sandboxes/{sandbox_id}/events`.
pub async fn sandbox_events(
    State(state): State<Arc<ApiState>>,
    Path(sandbox_id): Path<String>,
) -> Json<Vec<SystemEvent>> {
    Json(state.event_log.events_for(&sandbox_id))
}

/// Body for `POST /api/v1/sandboxes/{sandbox_id}/messages`.
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    /// Message body.
    pub content: String,
    /// Message category.
    pub message_type: MessageType,
}

/// `POST /api/v1/sandboxes/{sandbox_id}/messages`.
pub async fn send_sandbox_message(
    State(state): State<Arc<ApiState>>,
    Path(sandbox_id): Path<String>,
    Json(body): Json<SendMessageRequest>,
) -> Result<StatusCode, ApiError> {
    let sandbox = state.sandbox.as_ref().ok_or(ApiError::SandboxUnavailable)?;
    sandbox
        .send_message(&sandbox_id, &body.content, body.message_type)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}
