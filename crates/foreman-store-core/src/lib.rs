#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **foreman-store-core** – Persistence contract for the Foreman control
//! plane.
//!
//! Defines the [`ControlPlaneStore`] repository trait without providing a
//! concrete implementation; drivers (`foreman-store-memory`,
//! `foreman-store-sqlite`) implement it. Each trait method is its own
//! unit-of-work: it either applies its writes and returns `Ok`, or returns
//! `Err` with no partial effect. `claim_next_task` and
//! `claim_next_validation_task` are the two methods the data-model invariant
//! in §4.5 requires to be atomic under concurrent callers — the select and
//! the `pending → assigned` transition happen inside one unit of work so
//! exactly one caller observes success for a given task.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_types::{Agent, Budget, BudgetScope, CostRecord, EntityId, Task, TaskStatus, Ticket};

/// Errors raised by a [`ControlPlaneStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backend connection or transaction failed.
    #[error("storage backend error: {0}")]
    Backend(String),
    /// A write violated a uniqueness or referential constraint.
    #[error("constraint violation: {0}")]
    Constraint(String),
    /// The referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The stored payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Narrowing filter for `list_tasks`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Restrict to this ticket, if set.
    pub ticket_id: Option<EntityId>,
    /// Restrict to this status, if set.
    pub status: Option<TaskStatus>,
    /// Restrict to this assigned agent, if set.
    pub assigned_agent: Option<EntityId>,
}

/// Filter applied by `claim_next_task` beyond the structural
/// `status=pending, sandbox_id IS NULL, dependencies satisfied` conditions.
#[derive(Debug, Clone, Default)]
pub struct TaskClaimFilter {
    /// Only claim tasks in this phase.
    pub phase: Option<String>,
    /// Only claim tasks whose required capabilities (if any are encoded in
    /// the task's context) are a subset of this set.
    pub agent_capabilities: Option<Vec<String>>,
}

/// Persistence contract for the control plane's entities. See the module
/// docs for the unit-of-work discipline each method must uphold.
#[async_trait]
pub trait ControlPlaneStore: Send + Sync {
    // ---- Tickets ----------------------------------------------------

    /// Persist a newly created ticket.
    async fn insert_ticket(&self, ticket: &Ticket) -> Result<(), StorageError>;
    /// Fetch a ticket by id.
    async fn get_ticket(&self, id: EntityId) -> Result<Option<Ticket>, StorageError>;
    /// Overwrite a ticket's mutable fields.
    async fn update_ticket(&self, ticket: &Ticket) -> Result<(), StorageError>;
    /// List every ticket, newest first.
    async fn list_tickets(&self) -> Result<Vec<Ticket>, StorageError>;

    // ---- Tasks --------------------------------------------------------

    /// Persist a newly enqueued task.
    async fn insert_task(&self, task: &Task) -> Result<(), StorageError>;
    /// Fetch a task by id.
    async fn get_task(&self, id: EntityId) -> Result<Option<Task>, StorageError>;
    /// Overwrite a task's mutable fields (status, assignment, result, …).
    async fn update_task(&self, task: &Task) -> Result<(), StorageError>;
    /// List tasks matching `filter`.
    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, StorageError>;

    /// Atomically select and claim the next `pending` task per the
    /// ordering and eligibility rules of §4.5 `get_next_task`: structural
    /// eligibility (`sandbox_id IS NULL`, dependencies all `completed`,
    /// owning ticket `can_schedule()`), `filter`-narrowed, ordered by
    /// `(priority_rank DESC, created_at ASC)`. The winning task is
    /// transitioned to `Assigned` as part of the same unit of work; no two
    /// concurrent callers may observe the same task as claimed.
    async fn claim_next_task(&self, filter: TaskClaimFilter) -> Result<Option<Task>, StorageError>;

    /// Same discipline as [`Self::claim_next_task`], restricted to
    /// `status = pending_validation`.
    async fn claim_next_validation_task(&self) -> Result<Option<Task>, StorageError>;

    /// Tasks with `status=running` whose timeout has elapsed as of `now`.
    async fn get_timed_out_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>, StorageError>;

    /// Tasks in a cancellable status (`pending|assigned|running`).
    async fn get_cancellable_tasks(&self) -> Result<Vec<Task>, StorageError>;

    // ---- Agents ---------------------------------------------------------

    /// Persist a newly registered agent.
    async fn insert_agent(&self, agent: &Agent) -> Result<(), StorageError>;
    /// Fetch an agent by id.
    async fn get_agent(&self, id: EntityId) -> Result<Option<Agent>, StorageError>;
    /// Overwrite an agent's mutable fields.
    async fn update_agent(&self, agent: &Agent) -> Result<(), StorageError>;
    /// List every agent, for use by `search_agents` scoring in
    /// `foreman-registry` (this trait exposes no capability-matching logic
    /// itself — that lives with the domain, not the store).
    async fn list_agents(&self) -> Result<Vec<Agent>, StorageError>;

    // ---- Cost & budget --------------------------------------------------

    /// Persist an immutable cost record. Never updated after insertion.
    async fn insert_cost_record(&self, record: &CostRecord) -> Result<(), StorageError>;
    /// List cost records attributed to `task_id`.
    async fn list_cost_records_for_task(
        &self,
        task_id: EntityId,
    ) -> Result<Vec<CostRecord>, StorageError>;

    /// Persist a newly created budget.
    async fn insert_budget(&self, budget: &Budget) -> Result<(), StorageError>;
    /// Overwrite a budget's mutable fields (`spent_amount`, `alert_triggered`).
    async fn update_budget(&self, budget: &Budget) -> Result<(), StorageError>;
    /// List active budgets for `scope_type`/`scope_id` (and the always-active
    /// global budget, when the caller asks for `BudgetScope::Global`).
    async fn list_budgets_for_scope(
        &self,
        scope_type: BudgetScope,
        scope_id: Option<String>,
    ) -> Result<Vec<Budget>, StorageError>;
}
