#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **foreman-queue** – Task queue for the Foreman control plane (§4.5).
//!
//! Wraps [`ControlPlaneStore`]'s atomic-claim primitives with the queue's
//! status-machine discipline: `enqueue_task`, `assign_task`,
//! `update_task_status`, the timeout/cancel reaper helpers, and the event
//! emissions each transition implies. The store owns claim atomicity;
//! this crate owns what a claim or status write *means*.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use foreman_bus::{EventBus, EventType, SystemEvent};
use foreman_store_core::{ControlPlaneStore, StorageError, TaskClaimFilter};
use foreman_types::{
    Agent, ApprovalStatus, EntityId, Task, TaskDependencies, TaskStatus, Ticket, TicketPriority,
};
use serde_json::Value as Json;

/// Errors raised by [`TaskQueue`] operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The backing store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The referenced task does not exist.
    #[error("task not found: {0}")]
    TaskNotFound(EntityId),
    /// The owning ticket's approval gate does not permit scheduling.
    #[error("ticket {0} does not permit scheduling (approval_status blocks it)")]
    SchedulingBlocked(EntityId),
}

/// Task queue operations (§4.5): enqueueing, atomic claiming, and the
/// status-machine transitions that follow a claim.
pub struct TaskQueue {
    store: Arc<dyn ControlPlaneStore>,
    bus: Arc<dyn EventBus>,
}

impl TaskQueue {
    /// Construct a queue backed by `store` and `bus`.
    pub fn new(store: Arc<dyn ControlPlaneStore>, bus: Arc<dyn EventBus>) -> Self {
        Self { store, bus }
    }

    /// Enqueue a new task under `ticket`, inheriting its priority unless
    /// `priority` overrides it. Rejects scheduling against a ticket whose
    /// approval gate does not allow it.
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue_task(
        &self,
        ticket: &Ticket,
        phase: impl Into<String>,
        task_type: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        priority: Option<TicketPriority>,
        dependencies: TaskDependencies,
    ) -> Result<Task, QueueError> {
        if !ticket.can_schedule() {
            return Err(QueueError::SchedulingBlocked(ticket.id));
        }
        let task = Task::new(
            ticket.id,
            phase,
            task_type,
            title,
            description,
            priority.unwrap_or(ticket.priority),
            dependencies,
        );
        self.store.insert_task(&task).await?;
        Ok(task)
    }

    /// Atomically claim the next eligible `pending` task (§4.5's
    /// `get_next_task`), narrowed by `filter`.
    pub async fn get_next_task(&self, filter: TaskClaimFilter) -> Result<Option<Task>, QueueError> {
        Ok(self.store.claim_next_task(filter).await?)
    }

    /// Atomically claim the next eligible `pending_validation` task.
    pub async fn get_next_validation_task(&self) -> Result<Option<Task>, QueueError> {
        Ok(self.store.claim_next_validation_task().await?)
    }

    /// Bind `agent` to `task`, transitioning `pending → assigned`.
    /// Idempotent if `task` is already assigned to the same agent.
    pub async fn assign_task(&self, mut task: Task, agent: &Agent) -> Result<Task, QueueError> {
        if task.status == TaskStatus::Assigned && task.assigned_agent == Some(agent.id) {
            return Ok(task);
        }
        task.assigned_agent = Some(agent.id);
        task.status = TaskStatus::Assigned;
        task.updated_at = Utc::now();
        self.store.update_task(&task).await?;

        let _ = self.bus.publish(&SystemEvent::new(EventType::TaskAssigned, "task", task.id));
        Ok(task)
    }

    /// Write a new status onto `task`, applying the `started_at`/
    /// `completed_at` bookkeeping and emitting the matching event.
    pub async fn update_task_status(
        &self,
        mut task: Task,
        status: TaskStatus,
        result: Option<Json>,
        error_message: Option<String>,
        conversation_id: Option<String>,
    ) -> Result<Task, QueueError> {
        let now = Utc::now();
        if status == TaskStatus::Running && task.started_at.is_none() {
            task.started_at = Some(now);
        }
        if status.is_terminal() {
            task.completed_at = Some(now);
        }
        task.status = status;
        if result.is_some() {
            task.result = result;
        }
        if error_message.is_some() {
            task.error_message = error_message;
        }
        if conversation_id.is_some() {
            task.conversation_id = conversation_id;
        }
        task.updated_at = now;
        self.store.update_task(&task).await?;

        let event_type = match status {
            TaskStatus::Completed => EventType::TaskCompleted,
            TaskStatus::Failed => EventType::TaskFailed,
            TaskStatus::PendingValidation => EventType::TaskValidationRequested,
            _ => EventType::TaskStatusChanged,
        };
        let _ = self.bus.publish(&SystemEvent::with_payload(
            event_type,
            "task",
            task.id,
            serde_json::json!({ "status": task.status }),
        ));
        Ok(task)
    }

    /// `true` iff `task.status == Running` and its timeout has elapsed.
    pub fn check_task_timeout(&self, task: &Task, now: DateTime<Utc>) -> bool {
        task.is_timed_out(now)
    }

    /// Terminal transition to `failed` for a task that exceeded its
    /// timeout, emitting `TASK_TIMED_OUT`.
    pub async fn mark_task_timeout(
        &self,
        mut task: Task,
        reason: Option<&str>,
    ) -> Result<Task, QueueError> {
        let now = Utc::now();
        task.status = TaskStatus::Failed;
        task.completed_at = Some(now);
        task.error_message =
            Some(format!("Task timed out: {}", reason.unwrap_or("timeout_seconds exceeded")));
        task.updated_at = now;
        self.store.update_task(&task).await?;

        let _ = self.bus.publish(&SystemEvent::new(EventType::TaskTimedOut, "task", task.id));
        Ok(task)
    }

    /// Terminal transition to `failed` for a cancellable task
    /// (`pending|assigned|running`).
    pub async fn cancel_task(&self, mut task: Task, reason: &str) -> Result<Task, QueueError> {
        if !task.is_cancellable() {
            return Ok(task);
        }
        let now = Utc::now();
        task.status = TaskStatus::Failed;
        task.completed_at = Some(now);
        task.error_message = Some(format!("Task cancelled: {reason}"));
        task.updated_at = now;
        self.store.update_task(&task).await?;

        let _ = self.bus.publish(&SystemEvent::with_payload(
            EventType::TaskStatusChanged,
            "task",
            task.id,
            serde_json::json!({ "status": "failed", "reason": "cancelled" }),
        ));
        Ok(task)
    }

    /// Tasks with `status=running` whose timeout has elapsed.
    pub async fn get_timed_out_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>, QueueError> {
        Ok(self.store.get_timed_out_tasks(now).await?)
    }

    /// Approve a ticket pending review, unblocking its tasks for scheduling.
    pub async fn approve_ticket(&self, mut ticket: Ticket, approved_by: &str) -> Result<Ticket, QueueError> {
        ticket.approval_status = ApprovalStatus::Approved;
        ticket.updated_at = Utc::now();
        self.store.update_ticket(&ticket).await?;

        let _ = self.bus.publish(&SystemEvent::with_payload(
            EventType::TicketApproved,
            "ticket",
            ticket.id,
            serde_json::json!({ "approved_by": approved_by }),
        ));
        Ok(ticket)
    }

    /// Reject a ticket pending review. Its tasks remain permanently
    /// unschedulable; there is no path back to `pending_review`.
    pub async fn reject_ticket(
        &self,
        mut ticket: Ticket,
        rejected_by: &str,
        reason: &str,
    ) -> Result<Ticket, QueueError> {
        ticket.approval_status = ApprovalStatus::Rejected;
        ticket.updated_at = Utc::now();
        self.store.update_ticket(&ticket).await?;

        let _ = self.bus.publish(&SystemEvent::with_payload(
            EventType::TicketRejected,
            "ticket",
            ticket.id,
            serde_json::json!({ "rejected_by": rejected_by, "reason": reason }),
        ));
        Ok(ticket)
    }

    /// Tickets still awaiting a reviewer decision.
    pub async fn get_tickets_pending_approval(&self) -> Result<Vec<Ticket>, QueueError> {
        Ok(self
            .store
            .list_tickets()
            .await?
            .into_iter()
            .filter(|t| t.approval_status == ApprovalStatus::PendingReview)
            .collect())
    }

    /// Sweep once: apply the approval-timeout transition to every ticket
    /// whose deadline has elapsed, emitting `TICKET_STATUS_CHANGED` for
    /// each one that actually times out.
    pub async fn check_approval_timeouts(&self) -> Result<Vec<Ticket>, QueueError> {
        let now = Utc::now();
        let mut timed_out = Vec::new();
        for mut ticket in self.get_tickets_pending_approval().await? {
            if ticket.apply_approval_timeout(now) {
                self.store.update_ticket(&ticket).await?;
                let _ = self.bus.publish(&SystemEvent::with_payload(
                    EventType::TicketStatusChanged,
                    "ticket",
                    ticket.id,
                    serde_json::json!({ "approval_status": "timed_out" }),
                ));
                timed_out.push(ticket);
            }
        }
        Ok(timed_out)
    }

    /// Tasks in a cancellable status.
    pub async fn get_cancellable_tasks(&self) -> Result<Vec<Task>, QueueError> {
        Ok(self.store.get_cancellable_tasks().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_bus::InMemoryBus;
    use foreman_store_memory::MemoryStore;

    fn ticket() -> Ticket {
        Ticket::new("t", "d", "backend", TicketPriority::Medium, EntityId::new(), EntityId::new()).unwrap()
    }

    fn harness() -> (TaskQueue, Arc<dyn ControlPlaneStore>) {
        let store: Arc<dyn ControlPlaneStore> = Arc::new(MemoryStore::new());
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new(64));
        (TaskQueue::new(store.clone(), bus), store)
    }

    #[tokio::test]
    async fn enqueue_rejects_a_ticket_that_cannot_schedule() {
        let (queue, _store) = harness();
        let mut t = ticket();
        t.approval_status = foreman_types::ApprovalStatus::PendingReview;
        let err = queue
            .enqueue_task(&t, "backend", "implement_feature", "t", "d", None, TaskDependencies::none())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::SchedulingBlocked(_)));
    }

    #[tokio::test]
    async fn enqueue_inherits_ticket_priority_by_default() {
        let (queue, _store) = harness();
        let t = ticket();
        let task = queue
            .enqueue_task(&t, "backend", "implement_feature", "t", "d", None, TaskDependencies::none())
            .await
            .unwrap();
        assert_eq!(task.priority, TicketPriority::Medium);
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn claim_respects_dependency_readiness() {
        let (queue, store) = harness();
        let t = ticket();
        store.insert_ticket(&t).await.unwrap();

        let dep = queue
            .enqueue_task(&t, "backend", "write_tests", "t", "d", None, TaskDependencies::none())
            .await
            .unwrap();
        let _gated = queue
            .enqueue_task(
                &t,
                "backend",
                "implement_feature",
                "t",
                "d",
                None,
                TaskDependencies::new(vec![dep.id]),
            )
            .await
            .unwrap();

        let claimed = queue.get_next_task(TaskClaimFilter::default()).await.unwrap().unwrap();
        assert_eq!(claimed.id, dep.id, "only the dependency-free task is claimable");

        let none = queue.get_next_task(TaskClaimFilter::default()).await.unwrap();
        assert!(none.is_none(), "the gated task stays pending until its dependency completes");
    }

    #[tokio::test]
    async fn update_task_status_sets_started_and_completed_timestamps() {
        let (queue, store) = harness();
        let t = ticket();
        store.insert_ticket(&t).await.unwrap();
        let task = queue
            .enqueue_task(&t, "backend", "implement_feature", "t", "d", None, TaskDependencies::none())
            .await
            .unwrap();

        let running = queue
            .update_task_status(task, TaskStatus::Running, None, None, None)
            .await
            .unwrap();
        assert!(running.started_at.is_some());
        assert!(running.completed_at.is_none());

        let done = queue
            .update_task_status(
                running,
                TaskStatus::Completed,
                Some(serde_json::json!({"ok": true})),
                None,
                None,
            )
            .await
            .unwrap();
        assert!(done.completed_at.is_some());
        assert_eq!(done.result, Some(serde_json::json!({"ok": true})));
    }

    #[tokio::test]
    async fn mark_task_timeout_fails_with_expected_message() {
        let (queue, store) = harness();
        let t = ticket();
        store.insert_ticket(&t).await.unwrap();
        let task = queue
            .enqueue_task(&t, "backend", "implement_feature", "t", "d", None, TaskDependencies::none())
            .await
            .unwrap();

        let timed_out = queue.mark_task_timeout(task, Some("no heartbeat")).await.unwrap();
        assert_eq!(timed_out.status, TaskStatus::Failed);
        assert_eq!(timed_out.error_message.as_deref(), Some("Task timed out: no heartbeat"));
    }

    #[tokio::test]
    async fn cancel_task_is_a_no_op_once_terminal() {
        let (queue, store) = harness();
        let t = ticket();
        store.insert_ticket(&t).await.unwrap();
        let task = queue
            .enqueue_task(&t, "backend", "implement_feature", "t", "d", None, TaskDependencies::none())
            .await
            .unwrap();
        let done = queue
            .update_task_status(task, TaskStatus::Completed, None, None, None)
            .await
            .unwrap();

        let after = queue.cancel_task(done.clone(), "operator request").await.unwrap();
        assert_eq!(after.status, TaskStatus::Completed, "terminal tasks are not cancellable");
    }

    #[tokio::test]
    async fn approve_ticket_unblocks_scheduling() {
        let (queue, store) = harness();
        let mut t = ticket();
        t.approval_status = ApprovalStatus::PendingReview;
        store.insert_ticket(&t).await.unwrap();

        let approved = queue.approve_ticket(t, "reviewer-1").await.unwrap();
        assert_eq!(approved.approval_status, ApprovalStatus::Approved);
        assert!(approved.can_schedule());
    }

    #[tokio::test]
    async fn reject_ticket_leaves_it_permanently_unschedulable() {
        let (queue, store) = harness();
        let mut t = ticket();
        t.approval_status = ApprovalStatus::PendingReview;
        store.insert_ticket(&t).await.unwrap();

        let rejected = queue.reject_ticket(t, "reviewer-1", "out of scope").await.unwrap();
        assert_eq!(rejected.approval_status, ApprovalStatus::Rejected);
        assert!(!rejected.can_schedule());
    }

    #[tokio::test]
    async fn check_approval_timeouts_only_sweeps_elapsed_deadlines() {
        let (queue, store) = harness();
        let mut not_due = ticket();
        not_due.approval_status = ApprovalStatus::PendingReview;
        not_due.approval_deadline = Some(Utc::now() + chrono::Duration::hours(1));
        store.insert_ticket(&not_due).await.unwrap();

        let mut due = ticket();
        due.approval_status = ApprovalStatus::PendingReview;
        due.approval_deadline = Some(Utc::now() - chrono::Duration::seconds(1));
        store.insert_ticket(&due).await.unwrap();

        let timed_out = queue.check_approval_timeouts().await.unwrap();
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].id, due.id);
        assert_eq!(timed_out[0].approval_status, ApprovalStatus::TimedOut);

        let still_pending = store.get_ticket(not_due.id).await.unwrap().unwrap();
        assert_eq!(still_pending.approval_status, ApprovalStatus::PendingReview);
    }

    #[tokio::test]
    async fn assign_task_is_idempotent_for_the_same_agent() {
        let (queue, store) = harness();
        let t = ticket();
        store.insert_ticket(&t).await.unwrap();
        let task = queue
            .enqueue_task(&t, "backend", "implement_feature", "t", "d", None, TaskDependencies::none())
            .await
            .unwrap();
        let agent = Agent::new("claude-code", "backend", "claude-code-backend-001", vec!["backend".into()], 1, "PEM");

        let first = queue.assign_task(task, &agent).await.unwrap();
        let second = queue.assign_task(first.clone(), &agent).await.unwrap();
        assert_eq!(second.assigned_agent, Some(agent.id));
    }
}
