//! `/api/v1/tasks` (§6).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use foreman_store_core::TaskFilter;
use foreman_types::{EntityId, Task, TaskDependencies, TaskStatus, TicketPriority};
use serde::Deserialize;

use crate::state::ApiState;
use crate::ApiError;

/// Query params for `GET /api/v1/tasks`.
#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    /// Restrict to this ticket.
    pub ticket_id: Option<EntityId>,
    /// Restrict to this status.
    pub status: Option<TaskStatus>,
    /// Restrict to this assigned agent.
    pub assigned_agent: Option<EntityId>,
}

/// `GET /api/v1/tasks`.
pub async fn list_tasks(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let filter =
        TaskFilter { ticket_id: query.ticket_id, status: query.status, assigned_agent: query.assigned_agent };
    let tasks = state.store.list_tasks(filter).await?;
    Ok(Json(tasks))
}

/// Body for `POST /api/v1/tasks`.
#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    /// The owning ticket.
    pub ticket_id: EntityId,
    /// Implementation phase tag.
    pub phase: String,
    /// Free-form task type tag.
    pub task_type: String,
    /// Short title.
    pub title: String,
    /// Full description.
    pub description: String,
    /// Overrides the ticket's priority if set.
    pub priority: Option<TicketPriority>,
    /// Tasks that must complete before this one is schedulable.
    pub depends_on: Option<Vec<EntityId>>,
}

/// `POST /api/v1/tasks`.
pub async fn create_task(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let ticket = state.store.get_ticket(body.ticket_id).await?.ok_or(ApiError::NotFound)?;
    let dependencies = body.depends_on.map(TaskDependencies::new).unwrap_or_else(TaskDependencies::none);

    let task = state
        .queue
        .enqueue_task(&ticket, body.phase, body.task_type, body.title, body.description, body.priority, dependencies)
        .await
        .map_err(ApiError::from_queue)?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// Body for `PATCH /api/v1/tasks/{id}`.
#[derive(Debug, Deserialize)]
pub struct PatchTaskRequest {
    /// New status to transition to, if set.
    pub status: Option<TaskStatus>,
    /// Replaces `task.result` if set.
    pub result: Option<serde_json::Value>,
    /// Replaces `task.error_message` if set.
    pub error_message: Option<String>,
    /// Replaces `task.conversation_id` if set.
    pub conversation_id: Option<String>,
}

/// `PATCH /api/v1/tasks/{id}`.
pub async fn patch_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(body): Json<PatchTaskRequest>,
) -> Result<Json<Task>, ApiError> {
    let id = crate::parse_id(&id)?;
    let task = state.store.get_task(id).await?.ok_or(ApiError::NotFound)?;

    let task = if let Some(status) = body.status {
        state
            .queue
            .update_task_status(task, status, body.result, body.error_message, body.conversation_id)
            .await
            .map_err(ApiError::from_queue)?
    } else {
        let mut task = task;
        if body.result.is_some() {
            task.result = body.result;
        }
        if body.error_message.is_some() {
            task.error_message = body.error_message;
        }
        if body.conversation_id.is_some() {
            task.conversation_id = body.conversation_id;
        }
        task.updated_at = chrono::Utc::now();
        state.store.update_task(&task).await?;
        task
    };

    Ok(Json(task))
}
