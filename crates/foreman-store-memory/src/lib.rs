#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **foreman-store-memory** – In-memory persistence driver for the Foreman
//! control plane.
//!
//! Backs every entity with an `Arc<RwLock<HashMap<...>>>`; fast, convenient
//! for tests and local development, not durable across process restarts.
//! `claim_next_task`/`claim_next_validation_task` take the tasks-map write
//! lock for their full select-then-transition body, which is what makes
//! them atomic against concurrent callers in this driver.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use foreman_store_core::{ControlPlaneStore, StorageError, TaskClaimFilter, TaskFilter};
use foreman_types::{
    Agent, Budget, BudgetScope, CostRecord, EntityId, Task, TaskStatus, Ticket,
};

/// An in-memory, non-persistent implementation of [`ControlPlaneStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tickets: Arc<RwLock<HashMap<EntityId, Ticket>>>,
    tasks: Arc<RwLock<HashMap<EntityId, Task>>>,
    agents: Arc<RwLock<HashMap<EntityId, Agent>>>,
    cost_records: Arc<RwLock<Vec<CostRecord>>>,
    budgets: Arc<RwLock<HashMap<EntityId, Budget>>>,
}

impl MemoryStore {
    /// Create a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether every dependency of `task` is present and `completed` in the
    /// given task map.
    fn dependencies_satisfied(task: &Task, tasks: &HashMap<EntityId, Task>) -> bool {
        task.dependencies
            .depends_on
            .iter()
            .all(|dep_id| tasks.get(dep_id).map(|t| t.status == TaskStatus::Completed).unwrap_or(false))
    }

    fn claim_candidate(
        task: &Task,
        status_gate: TaskStatus,
        tasks: &HashMap<EntityId, Task>,
        tickets: &HashMap<EntityId, Ticket>,
        filter: &TaskClaimFilter,
    ) -> bool {
        if task.status != status_gate || task.sandbox_id.is_some() {
            return false;
        }
        if !Self::dependencies_satisfied(task, tasks) {
            return false;
        }
        if let Some(ticket) = tickets.get(&task.ticket_id) {
            if !ticket.can_schedule() {
                return false;
            }
        }
        if let Some(phase) = &filter.phase {
            if &task.phase != phase {
                return false;
            }
        }
        if let Some(caps) = &filter.agent_capabilities {
            let required = task.task_type.trim().to_lowercase();
            if !caps.iter().any(|c| c == &required) {
                return false;
            }
        }
        true
    }

    /// `(priority_rank DESC, created_at ASC)` per §4.5.
    fn claim_order_key(task: &Task) -> (std::cmp::Reverse<u8>, DateTime<Utc>) {
        (std::cmp::Reverse(task.priority.rank()), task.created_at)
    }
}

#[async_trait]
impl ControlPlaneStore for MemoryStore {
    async fn insert_ticket(&self, ticket: &Ticket) -> Result<(), StorageError> {
        self.tickets.write().await.insert(ticket.id, ticket.clone());
        Ok(())
    }

    async fn get_ticket(&self, id: EntityId) -> Result<Option<Ticket>, StorageError> {
        Ok(self.tickets.read().await.get(&id).cloned())
    }

    async fn update_ticket(&self, ticket: &Ticket) -> Result<(), StorageError> {
        let mut guard = self.tickets.write().await;
        if !guard.contains_key(&ticket.id) {
            return Err(StorageError::NotFound(format!("ticket {}", ticket.id)));
        }
        guard.insert(ticket.id, ticket.clone());
        Ok(())
    }

    async fn list_tickets(&self) -> Result<Vec<Ticket>, StorageError> {
        let mut out: Vec<Ticket> = self.tickets.read().await.values().cloned().collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn insert_task(&self, task: &Task) -> Result<(), StorageError> {
        self.tasks.write().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: EntityId) -> Result<Option<Task>, StorageError> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn update_task(&self, task: &Task) -> Result<(), StorageError> {
        let mut guard = self.tasks.write().await;
        if !guard.contains_key(&task.id) {
            return Err(StorageError::NotFound(format!("task {}", task.id)));
        }
        guard.insert(task.id, task.clone());
        Ok(())
    }

    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, StorageError> {
        let guard = self.tasks.read().await;
        let mut out: Vec<Task> = guard
            .values()
            .filter(|t| filter.ticket_id.map(|id| id == t.ticket_id).unwrap_or(true))
            .filter(|t| filter.status.map(|s| s == t.status).unwrap_or(true))
            .filter(|t| filter.assigned_agent.map(|a| Some(a) == t.assigned_agent).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by_key(Self::claim_order_key);
        Ok(out)
    }

    async fn claim_next_task(&self, filter: TaskClaimFilter) -> Result<Option<Task>, StorageError> {
        let mut tasks = self.tasks.write().await;
        let tickets = self.tickets.read().await;

        let winner_id = tasks
            .values()
            .filter(|t| Self::claim_candidate(t, TaskStatus::Pending, &tasks, &tickets, &filter))
            .min_by_key(|t| Self::claim_order_key(t))
            .map(|t| t.id);

        let Some(id) = winner_id else { return Ok(None) };
        let task = tasks.get_mut(&id).expect("winner id came from this map");
        task.status = TaskStatus::Assigned;
        task.updated_at = Utc::now();
        Ok(Some(task.clone()))
    }

    async fn claim_next_validation_task(&self) -> Result<Option<Task>, StorageError> {
        let mut tasks = self.tasks.write().await;
        let tickets = self.tickets.read().await;
        let filter = TaskClaimFilter::default();

        let winner_id = tasks
            .values()
            .filter(|t| {
                Self::claim_candidate(t, TaskStatus::PendingValidation, &tasks, &tickets, &filter)
            })
            .min_by_key(|t| Self::claim_order_key(t))
            .map(|t| t.id);

        let Some(id) = winner_id else { return Ok(None) };
        // Validation claims do not re-assign the agent; the validator
        // pipeline (C16) owns the transition out of `pending_validation`.
        Ok(tasks.get(&id).cloned())
    }

    async fn get_timed_out_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>, StorageError> {
        Ok(self.tasks.read().await.values().filter(|t| t.is_timed_out(now)).cloned().collect())
    }

    async fn get_cancellable_tasks(&self) -> Result<Vec<Task>, StorageError> {
        Ok(self.tasks.read().await.values().filter(|t| t.is_cancellable()).cloned().collect())
    }

    async fn insert_agent(&self, agent: &Agent) -> Result<(), StorageError> {
        self.agents.write().await.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn get_agent(&self, id: EntityId) -> Result<Option<Agent>, StorageError> {
        Ok(self.agents.read().await.get(&id).cloned())
    }

    async fn update_agent(&self, agent: &Agent) -> Result<(), StorageError> {
        let mut guard = self.agents.write().await;
        if !guard.contains_key(&agent.id) {
            return Err(StorageError::NotFound(format!("agent {}", agent.id)));
        }
        guard.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, StorageError> {
        Ok(self.agents.read().await.values().cloned().collect())
    }

    async fn insert_cost_record(&self, record: &CostRecord) -> Result<(), StorageError> {
        self.cost_records.write().await.push(record.clone());
        Ok(())
    }

    async fn list_cost_records_for_task(
        &self,
        task_id: EntityId,
    ) -> Result<Vec<CostRecord>, StorageError> {
        Ok(self
            .cost_records
            .read()
            .await
            .iter()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn insert_budget(&self, budget: &Budget) -> Result<(), StorageError> {
        self.budgets.write().await.insert(budget.id, budget.clone());
        Ok(())
    }

    async fn update_budget(&self, budget: &Budget) -> Result<(), StorageError> {
        let mut guard = self.budgets.write().await;
        if !guard.contains_key(&budget.id) {
            return Err(StorageError::NotFound(format!("budget {}", budget.id)));
        }
        guard.insert(budget.id, budget.clone());
        Ok(())
    }

    async fn list_budgets_for_scope(
        &self,
        scope_type: BudgetScope,
        scope_id: Option<String>,
    ) -> Result<Vec<Budget>, StorageError> {
        Ok(self
            .budgets
            .read()
            .await
            .values()
            .filter(|b| b.scope_type == scope_type && b.scope_id == scope_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_types::{TaskDependencies, TicketPriority};

    fn ticket() -> Ticket {
        Ticket::new("t", "desc", "backend", TicketPriority::Medium, EntityId::new(), EntityId::new()).unwrap()
    }

    #[tokio::test]
    async fn claim_next_task_picks_highest_priority_then_oldest() {
        let store = MemoryStore::new();
        let ticket = ticket();
        store.insert_ticket(&ticket).await.unwrap();

        let mut low = Task::new(ticket.id, "backend", "implement_feature", "low", "d", TicketPriority::Low, TaskDependencies::none());
        let mut high = Task::new(ticket.id, "backend", "implement_feature", "high", "d", TicketPriority::High, TaskDependencies::none());
        low.created_at = Utc::now() - chrono::Duration::seconds(10);
        high.created_at = Utc::now();
        store.insert_task(&low).await.unwrap();
        store.insert_task(&high).await.unwrap();

        let claimed = store.claim_next_task(TaskClaimFilter::default()).await.unwrap().unwrap();
        assert_eq!(claimed.id, high.id);
        assert_eq!(claimed.status, TaskStatus::Assigned);
    }

    #[tokio::test]
    async fn claim_next_task_skips_tasks_with_unmet_dependencies() {
        let store = MemoryStore::new();
        let ticket = ticket();
        store.insert_ticket(&ticket).await.unwrap();

        let blocker = Task::new(ticket.id, "backend", "implement_feature", "b", "d", TicketPriority::Medium, TaskDependencies::none());
        let dependent = Task::new(
            ticket.id,
            "backend",
            "implement_feature",
            "dep",
            "d",
            TicketPriority::Critical,
            TaskDependencies::new(vec![blocker.id]),
        );
        store.insert_task(&blocker).await.unwrap();
        store.insert_task(&dependent).await.unwrap();

        let claimed = store.claim_next_task(TaskClaimFilter::default()).await.unwrap().unwrap();
        assert_eq!(claimed.id, blocker.id, "dependent task must not be claimable until blocker completes");
    }

    #[tokio::test]
    async fn claim_next_task_blocked_by_unapproved_ticket() {
        let store = MemoryStore::new();
        let mut t = ticket();
        t.approval_status = foreman_types::ApprovalStatus::PendingReview;
        store.insert_ticket(&t).await.unwrap();

        let task = Task::new(t.id, "backend", "implement_feature", "x", "d", TicketPriority::Medium, TaskDependencies::none());
        store.insert_task(&task).await.unwrap();

        let claimed = store.claim_next_task(TaskClaimFilter::default()).await.unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn concurrent_claims_never_double_assign() {
        let store = MemoryStore::new();
        let ticket = ticket();
        store.insert_ticket(&ticket).await.unwrap();
        let task = Task::new(ticket.id, "backend", "implement_feature", "x", "d", TicketPriority::Medium, TaskDependencies::none());
        store.insert_task(&task).await.unwrap();

        let (a, b) = tokio::join!(
            store.claim_next_task(TaskClaimFilter::default()),
            store.claim_next_task(TaskClaimFilter::default())
        );
        let successes = [a.unwrap(), b.unwrap()].into_iter().flatten().count();
        assert_eq!(successes, 1);
    }
}
