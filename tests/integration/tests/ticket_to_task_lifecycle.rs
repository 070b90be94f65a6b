//! End-to-end flow: ticket creation, task enqueue, claim, completion, and
//! the events each transition publishes on the bus.

use std::sync::Arc;

use foreman_bus::{EventBus, EventType, InMemoryBus};
use foreman_queue::TaskQueue;
use foreman_store_core::{ControlPlaneStore, TaskFilter};
use foreman_store_memory::MemoryStore;
use foreman_types::{EntityId, Task, TaskDependencies, TaskStatus, Ticket, TicketPriority};

fn harness() -> (Arc<dyn ControlPlaneStore>, Arc<TaskQueue>, Arc<dyn EventBus>) {
    let store: Arc<dyn ControlPlaneStore> = Arc::new(MemoryStore::new());
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new(64));
    let queue = Arc::new(TaskQueue::new(store.clone(), bus.clone()));
    (store, queue, bus)
}

#[tokio::test]
async fn ticket_enqueue_claim_complete_round_trip() {
    let (store, queue, bus) = harness();
    let mut events = bus.subscribe();

    let ticket = Ticket::new(
        "Add retry to webhook delivery",
        "Webhook POSTs should retry with backoff on 5xx.",
        "backend",
        TicketPriority::High,
        EntityId::new(),
        EntityId::new(),
    )
    .unwrap();
    store.insert_ticket(&ticket).await.unwrap();
    assert!(ticket.can_schedule());

    let task = queue
        .enqueue_task(
            &ticket,
            "backend",
            "implement_feature",
            "Add retry to webhook delivery",
            "Webhook POSTs should retry with backoff on 5xx.",
            None,
            TaskDependencies::none(),
        )
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.priority, TicketPriority::High);

    let filter = TaskFilter { ticket_id: Some(ticket.id), status: None, assigned_agent: None };
    let listed = store.list_tasks(filter).await.unwrap();
    assert_eq!(listed.len(), 1);

    let running = queue
        .update_task_status(task, TaskStatus::Running, None, None, Some("conv-1".into()))
        .await
        .unwrap();
    assert!(running.started_at.is_some());

    let result = serde_json::json!({"pull_request": "https://example.com/pr/1"});
    let completed = queue
        .update_task_status(running, TaskStatus::Completed, Some(result.clone()), None, None)
        .await
        .unwrap();
    assert!(completed.completed_at.is_some());
    assert_eq!(completed.result, Some(result));
    assert_eq!(completed.conversation_id.as_deref(), Some("conv-1"));

    let fetched = store.get_task(completed.id).await.unwrap().expect("task persisted");
    assert_eq!(fetched.status, TaskStatus::Completed);

    let mut saw_completed = false;
    while let Ok(event) = events.try_recv() {
        if event.event_type == EventType::TaskCompleted {
            saw_completed = true;
        }
    }
    assert!(saw_completed, "expected a TaskCompleted event on the bus");
}

#[tokio::test]
async fn unapproved_ticket_blocks_scheduling() {
    let (store, queue, _bus) = harness();

    let mut ticket = Ticket::new(
        "Rotate signing keys",
        "Requires sign-off before any agent touches credentials.",
        "security",
        TicketPriority::Critical,
        EntityId::new(),
        EntityId::new(),
    )
    .unwrap();
    ticket.approval_status = foreman_types::ApprovalStatus::PendingReview;
    store.insert_ticket(&ticket).await.unwrap();
    assert!(!ticket.can_schedule());

    let err = queue
        .enqueue_task(
            &ticket,
            "security",
            "implement_feature",
            "Rotate signing keys",
            "Requires sign-off before any agent touches credentials.",
            None,
            TaskDependencies::none(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, foreman_queue::QueueError::SchedulingBlocked(id) if id == ticket.id));
}

#[tokio::test]
async fn approving_a_pending_ticket_unblocks_its_queued_work() {
    let (store, queue, bus) = harness();
    let mut events = bus.subscribe();

    let mut ticket = Ticket::new(
        "Rotate signing keys",
        "Requires sign-off before any agent touches credentials.",
        "security",
        TicketPriority::Critical,
        EntityId::new(),
        EntityId::new(),
    )
    .unwrap();
    ticket.approval_status = foreman_types::ApprovalStatus::PendingReview;
    store.insert_ticket(&ticket).await.unwrap();

    let approved = queue.approve_ticket(ticket, "reviewer-1").await.unwrap();
    assert!(approved.can_schedule());

    let task = queue
        .enqueue_task(&approved, "security", "implement_feature", "Rotate signing keys", "d", None, TaskDependencies::none())
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Pending);

    let mut saw_approved = false;
    while let Ok(event) = events.try_recv() {
        if event.event_type == EventType::TicketApproved {
            saw_approved = true;
        }
    }
    assert!(saw_approved, "expected a TicketApproved event on the bus");
}

#[tokio::test]
async fn dependent_task_waits_on_its_parent() {
    let (store, queue, _bus) = harness();

    let ticket = Ticket::new("Ship feature", "d", "backend", TicketPriority::Medium, EntityId::new(), EntityId::new())
        .unwrap();
    store.insert_ticket(&ticket).await.unwrap();

    let parent: Task = queue
        .enqueue_task(&ticket, "backend", "implement_feature", "parent", "d", None, TaskDependencies::none())
        .await
        .unwrap();
    let child = queue
        .enqueue_task(
            &ticket,
            "backend",
            "write_tests",
            "child",
            "d",
            None,
            TaskDependencies::new(vec![parent.id]),
        )
        .await
        .unwrap();

    assert_eq!(child.dependencies.depends_on, vec![parent.id]);
}
