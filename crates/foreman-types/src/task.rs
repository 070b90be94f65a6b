//! Task entity: the unit of scheduling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{EntityId, TicketPriority};

/// Lifecycle status of a task. Terminal states are `Completed` and `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Enqueued, not yet claimed.
    Pending,
    /// Claimed by `get_next_task` / `assign_task`, not yet started.
    Assigned,
    /// In the process of being claimed (reserved for the narrow window an
    /// implementer's claim transaction may choose to expose; most drivers
    /// go straight `Pending` → `Assigned`).
    Claiming,
    /// An agent/sandbox is actively executing it.
    Running,
    /// Execution finished; awaiting a validator pass.
    PendingValidation,
    /// Validation failed; will be re-assigned for another attempt.
    NeedsRevision,
    /// Terminal success.
    Completed,
    /// Terminal failure (timeout, cancellation, budget exhaustion, or
    /// exhausted validation iterations).
    Failed,
}

impl TaskStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether a task in this status must have a non-null `assigned_agent`,
    /// per the data-model invariant in §3.
    pub fn requires_assigned_agent(self) -> bool {
        matches!(
            self,
            TaskStatus::Assigned
                | TaskStatus::Running
                | TaskStatus::Claiming
                | TaskStatus::PendingValidation
                | TaskStatus::NeedsRevision
        )
    }
}

/// Dependency list gating claimability: a task is only claimable once every
/// id in `depends_on` refers to a task whose status is `Completed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDependencies {
    /// Ids of tasks that must complete before this one becomes claimable.
    pub depends_on: Vec<EntityId>,
}

impl TaskDependencies {
    /// No dependencies: the task is ready as soon as it's pending.
    pub fn none() -> Self {
        Self::default()
    }

    /// Build from an explicit list of predecessor ids.
    pub fn new(depends_on: Vec<EntityId>) -> Self {
        Self { depends_on }
    }

    /// True once every dependency id is present in `completed`.
    pub fn satisfied_by(&self, completed: &std::collections::HashSet<EntityId>) -> bool {
        self.depends_on.iter().all(|dep| completed.contains(dep))
    }
}

/// A single dependency edge, used by the coordination/synthesis layer when
/// constructing or validating a dependency graph (distinct from
/// [`TaskDependencies`], which is the flattened list stored on a [`Task`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    /// The task that depends on `on`.
    pub task_id: EntityId,
    /// The task that must complete first.
    pub on: EntityId,
}

/// Default task timeout, in seconds, applied when none is specified.
pub const DEFAULT_TASK_TIMEOUT_SECONDS: i64 = 3600;

/// The unit of scheduling: one discrete piece of work belonging to a
/// [`crate::Ticket`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Opaque identifier.
    pub id: EntityId,
    /// Owning ticket.
    pub ticket_id: EntityId,
    /// Implementation phase tag, inherited from the ticket unless overridden.
    pub phase: String,
    /// Free-form task type tag, e.g. `"implement_feature"`, `"write_tests"`,
    /// `"validate"`.
    pub task_type: String,
    /// Short human-readable title.
    pub title: String,
    /// Full description of the work.
    pub description: String,
    /// Scheduling priority.
    pub priority: TicketPriority,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// The agent currently holding this task, if any. Must be `Some` iff
    /// `status.requires_assigned_agent()`.
    pub assigned_agent: Option<EntityId>,
    /// The sandbox executing this task, if any.
    pub sandbox_id: Option<String>,
    /// Predecessor tasks gating claimability.
    pub dependencies: TaskDependencies,
    /// Seconds after `started_at` before the task is considered timed out.
    pub timeout_seconds: i64,
    /// Set on the first transition into `Running`.
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the task reaches a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Human-readable failure detail, set on failure paths.
    pub error_message: Option<String>,
    /// Free-form result payload produced by the agent/validator.
    pub result: Option<Json>,
    /// Id of the LLM conversation/session that produced the current status,
    /// if one is associated with this update.
    pub conversation_id: Option<String>,
    /// Context injected by the synthesis engine when this task is a
    /// continuation of a join (`_join_id`, `_source_task_ids`, …).
    pub synthesis_context: Option<Json>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-modified timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Construct a new task in `Pending` status with no assignment.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ticket_id: EntityId,
        phase: impl Into<String>,
        task_type: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        priority: TicketPriority,
        dependencies: TaskDependencies,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new(),
            ticket_id,
            phase: phase.into(),
            task_type: task_type.into(),
            title: title.into(),
            description: description.into(),
            priority,
            status: TaskStatus::Pending,
            assigned_agent: None,
            sandbox_id: None,
            dependencies,
            timeout_seconds: DEFAULT_TASK_TIMEOUT_SECONDS,
            started_at: None,
            completed_at: None,
            error_message: None,
            result: None,
            conversation_id: None,
            synthesis_context: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this task is a structural candidate for `get_next_task`:
    /// pending and not already bound to a sandbox. Dependency readiness
    /// and phase/capability filters are evaluated by the caller against a
    /// wider view of the store.
    pub fn is_claim_candidate(&self) -> bool {
        self.status == TaskStatus::Pending && self.sandbox_id.is_none()
    }

    /// True iff `status=Running` and the timeout has elapsed relative to `now`.
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.started_at) {
            (TaskStatus::Running, Some(started)) => {
                (now - started).num_seconds() > self.timeout_seconds
            }
            _ => false,
        }
    }

    /// Whether `cancel_task` may be applied to this task's current status.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Pending | TaskStatus::Assigned | TaskStatus::Running
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ticket_id() -> EntityId {
        EntityId::new()
    }

    #[test]
    fn new_task_is_pending_with_no_assignment() {
        let task = Task::new(
            ticket_id(),
            "backend",
            "implement_feature",
            "t",
            "d",
            TicketPriority::Medium,
            TaskDependencies::none(),
        );
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assigned_agent.is_none());
        assert!(task.is_claim_candidate());
    }

    #[test]
    fn dependencies_satisfied_only_when_all_complete() {
        let a = EntityId::new();
        let b = EntityId::new();
        let deps = TaskDependencies::new(vec![a, b]);
        let mut completed = HashSet::new();
        assert!(!deps.satisfied_by(&completed));
        completed.insert(a);
        assert!(!deps.satisfied_by(&completed));
        completed.insert(b);
        assert!(deps.satisfied_by(&completed));
    }

    #[test]
    fn timeout_requires_running_and_elapsed_started_at() {
        let mut task = Task::new(
            ticket_id(),
            "backend",
            "implement_feature",
            "t",
            "d",
            TicketPriority::Medium,
            TaskDependencies::none(),
        );
        task.timeout_seconds = 10;
        assert!(!task.is_timed_out(Utc::now()));
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now() - chrono::Duration::seconds(20));
        assert!(task.is_timed_out(Utc::now()));
    }

    #[test]
    fn cancellable_statuses_match_spec() {
        let mut task = Task::new(
            ticket_id(),
            "backend",
            "implement_feature",
            "t",
            "d",
            TicketPriority::Medium,
            TaskDependencies::none(),
        );
        assert!(task.is_cancellable());
        task.status = TaskStatus::PendingValidation;
        assert!(!task.is_cancellable());
        task.status = TaskStatus::Completed;
        assert!(!task.is_cancellable());
    }

    #[test]
    fn terminal_statuses_match_spec() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::PendingValidation.is_terminal());
    }
}
