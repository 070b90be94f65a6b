//! `/api/v1/commits` (§6). VCS commit↔ticket linkage is an API-layer
//! concern; the control-plane store has no native commit entity, so links
//! are tracked here and surfaced onto tickets via `ticket.context` at the
//! caller's discretion.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use crate::state::{ApiState, CommitLink};
use crate::ApiError;

/// `GET /api/v1/commits/{sha}`.
pub async fn get_commit(State(state): State<Arc<ApiState>>, Path(sha): Path<String>) -> Result<Json<CommitLink>, ApiError> {
    let commits = state.commits.read().await;
    let commit = commits.iter().find(|c| c.sha == sha).cloned().ok_or(ApiError::NotFound)?;
    Ok(Json(commit))
}

/// `GET /api/v1/commits/ticket/{id}`.
pub async fn list_commits_for_ticket(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<CommitLink>>, ApiError> {
    let ticket_id = crate::parse_id(&id)?;
    let commits = state.commits.read().await;
    let matching: Vec<CommitLink> = commits.iter().filter(|c| c.ticket_id == ticket_id).cloned().collect();
    Ok(Json(matching))
}

/// Body for `POST /api/v1/commits/ticket/{id}/link`.
#[derive(Debug, Deserialize)]
pub struct LinkCommitRequest {
    /// Commit SHA to link.
    pub sha: String,
    /// Repository the commit lives in, `owner/name`.
    pub repo: String,
}

/// `POST /api/v1/commits/ticket/{id}/link`.
pub async fn link_commit(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(body): Json<LinkCommitRequest>,
) -> Result<Json<CommitLink>, ApiError> {
    let ticket_id = crate::parse_id(&id)?;
    state.store.get_ticket(ticket_id).await?.ok_or(ApiError::NotFound)?;

    let link = CommitLink { sha: body.sha, ticket_id, repo: body.repo, linked_at: chrono::Utc::now() };
    state.commits.write().await.push(link.clone());

    let _ = state.bus.publish(&foreman_bus::SystemEvent::with_payload(
        foreman_bus::EventType::CommitLinked,
        "ticket",
        ticket_id,
        serde_json::json!({ "sha": link.sha, "repo": link.repo }),
    ));
    Ok(Json(link))
}
