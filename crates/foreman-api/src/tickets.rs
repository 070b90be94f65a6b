//! `/api/v1/tickets` (§6).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{Duration, Utc};
use foreman_bus::{EventType, SystemEvent};
use foreman_types::{ApprovalStatus, EntityId, Ticket, TicketPriority};
use serde::{Deserialize, Serialize};

use crate::state::ApiState;
use crate::ApiError;

/// Default window a ticket has to clear its approval gate.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::hours(24);

/// Body for `POST /api/v1/tickets`.
#[derive(Debug, Deserialize)]
pub struct CreateTicketRequest {
    /// Short human-readable title.
    pub title: String,
    /// Full description of the requested work.
    pub description: String,
    /// Implementation phase tag.
    pub phase: String,
    /// Scheduling priority.
    pub priority: TicketPriority,
    /// Owning project.
    pub project_id: EntityId,
    /// Owning user.
    pub user_id: EntityId,
    /// If `true`, the ticket is created with `approval_status=pending_review`
    /// and a deadline `approval_timeout_seconds` out; otherwise it's
    /// immediately schedulable.
    pub requires_approval: bool,
    /// Overrides [`DEFAULT_APPROVAL_TIMEOUT`] when `requires_approval` is set.
    pub approval_timeout_seconds: Option<i64>,
}

/// `POST /api/v1/tickets`.
pub async fn create_ticket(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<CreateTicketRequest>,
) -> Result<(StatusCode, Json<Ticket>), ApiError> {
    let mut ticket = Ticket::new(body.title, body.description, body.phase, body.priority, body.project_id, body.user_id)
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;

    if body.requires_approval {
        ticket.approval_status = ApprovalStatus::PendingReview;
        let timeout = body
            .approval_timeout_seconds
            .map(Duration::seconds)
            .unwrap_or(DEFAULT_APPROVAL_TIMEOUT);
        ticket.approval_deadline = Some(Utc::now() + timeout);
    }

    state.store.insert_ticket(&ticket).await?;

    if ticket.approval_status == ApprovalStatus::PendingReview {
        let _ = state.bus.publish(&SystemEvent::with_payload(
            EventType::TicketApprovalPending,
            "ticket",
            ticket.id,
            serde_json::json!({ "approval_deadline": ticket.approval_deadline }),
        ));
    }

    Ok((StatusCode::CREATED, Json(ticket)))
}

/// Body for `POST /api/v1/tickets/{id}/approve`.
#[derive(Debug, Deserialize)]
pub struct ApproveTicketRequest {
    /// Who approved the ticket.
    pub approved_by: String,
}

/// `POST /api/v1/tickets/{id}/approve`. Fails with a conflict if the
/// ticket is not currently `pending_review`.
pub async fn approve_ticket(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(body): Json<ApproveTicketRequest>,
) -> Result<Json<Ticket>, ApiError> {
    let id = crate::parse_id(&id)?;
    let ticket = state.store.get_ticket(id).await?.ok_or(ApiError::NotFound)?;
    if ticket.approval_status != ApprovalStatus::PendingReview {
        return Err(ApiError::Conflict(format!("ticket {id} is not pending review")));
    }
    let ticket = state.queue.approve_ticket(ticket, &body.approved_by).await.map_err(ApiError::from_queue)?;
    Ok(Json(ticket))
}

/// Body for `POST /api/v1/tickets/{id}/reject`.
#[derive(Debug, Deserialize)]
pub struct RejectTicketRequest {
    /// Who rejected the ticket.
    pub rejected_by: String,
    /// Free-text rejection reason.
    pub reason: String,
}

/// `POST /api/v1/tickets/{id}/reject`. Fails with a conflict if the
/// ticket is not currently `pending_review`.
pub async fn reject_ticket(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(body): Json<RejectTicketRequest>,
) -> Result<Json<Ticket>, ApiError> {
    let id = crate::parse_id(&id)?;
    let ticket = state.store.get_ticket(id).await?.ok_or(ApiError::NotFound)?;
    if ticket.approval_status != ApprovalStatus::PendingReview {
        return Err(ApiError::Conflict(format!("ticket {id} is not pending review")));
    }
    let ticket = state
        .queue
        .reject_ticket(ticket, &body.rejected_by, &body.reason)
        .await
        .map_err(ApiError::from_queue)?;
    Ok(Json(ticket))
}

/// `GET /api/v1/tickets/{id}`.
pub async fn get_ticket(
    State(state): State<Arc<ApiState>>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Json<Ticket>, ApiError> {
    let id = crate::parse_id(&id)?;
    let ticket = state.store.get_ticket(id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(ticket))
}

/// Response payload shared by every endpoint that just echoes an entity id.
#[derive(Debug, Serialize)]
pub struct EntityIdResponse {
    /// The entity id.
    pub id: EntityId,
}
