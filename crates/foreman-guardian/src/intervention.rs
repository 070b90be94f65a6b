//! Guardian Intervention (§4.16): authority-ranked, append-only-audited
//! actions the Guardian can take against tasks and agents.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use foreman_auth::Authority;
use foreman_bus::{EventBus, EventType, SystemEvent};
use foreman_queue::{QueueError, TaskQueue};
use foreman_store_core::{ControlPlaneStore, StorageError};
use foreman_types::{Agent, EntityId, Task, TicketPriority};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use thiserror::Error;

/// Steering category a Guardian Analysis may recommend (§4.11). Unknown
/// strings from the LLM fall back to [`SteeringType::Redirect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SteeringType {
    /// Nudge the agent back toward its stated goal.
    Redirect,
    /// Ask the agent to clarify an ambiguous next step.
    Clarify,
    /// Hand the session to a human or higher-authority watcher.
    Escalate,
    /// Stop the agent's current line of work outright.
    Abort,
}

impl SteeringType {
    /// Parse a free-text steering type as reported by the LLM, defaulting
    /// to [`SteeringType::Redirect`] for anything unrecognized.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "clarify" => SteeringType::Clarify,
            "escalate" => SteeringType::Escalate,
            "abort" => SteeringType::Abort,
            _ => SteeringType::Redirect,
        }
    }
}

/// Resolves whether a project permits automatic Guardian steering. The
/// control plane's project settings aren't modeled in this crate; callers
/// inject a resolver backed by wherever that lives.
pub trait ProjectSettingsResolver: Send + Sync {
    /// Whether automatic (non-manual) interventions are permitted for the
    /// project owning `project_id`. `None` (no resolvable project) is
    /// treated as enabled.
    fn guardian_auto_steering(&self, project_id: Option<EntityId>) -> bool;
}

/// A resolver that always permits automatic steering; the default when no
/// project-level override is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAutoSteering;

impl ProjectSettingsResolver for AlwaysAutoSteering {
    fn guardian_auto_steering(&self, _project_id: Option<EntityId>) -> bool {
        true
    }
}

/// Errors raised while executing a Guardian intervention.
#[derive(Debug, Error)]
pub enum InterventionError {
    /// The caller's authority doesn't meet the action's requirement.
    #[error("authority {actual:?} does not satisfy required {required:?}")]
    InsufficientAuthority {
        /// The authority required by the action.
        required: Authority,
        /// The authority the caller actually presented.
        actual: Authority,
    },
    /// `reallocate_agent_capacity` was asked to move more capacity than
    /// the source agent has.
    #[error("cannot reallocate {n} from agent with capacity {available}")]
    InsufficientCapacity {
        /// Capacity requested.
        n: u32,
        /// Capacity actually available.
        available: u32,
    },
    /// `reallocate_agent_capacity` or similar was called with `n = 0`.
    #[error("reallocation amount must be greater than zero")]
    ZeroAmount,
    /// `revert_intervention` referenced an action id with no audit record.
    #[error("no intervention recorded for action {0}")]
    NotFound(EntityId),
    /// The backing store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The task queue failed applying the resulting status transition.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// One append-only audit record for a Guardian intervention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intervention {
    /// Opaque action id, referenced by `revert_intervention`.
    pub id: EntityId,
    /// The action name, e.g. `"emergency_cancel_task"`.
    pub action: String,
    /// Authority level the caller presented.
    pub authority: Authority,
    /// Who or what initiated the action.
    pub initiated_by: String,
    /// Whether this was a manual action (bypasses `guardian_auto_steering`).
    pub manual: bool,
    /// Whether the action was actually applied (`false` when
    /// `guardian_auto_steering` was disabled and this wasn't manual).
    pub executed: bool,
    /// Human-readable justification.
    pub reason: String,
    /// State snapshot before the action.
    pub before: Json,
    /// State snapshot after the action (`== before` when not executed).
    pub after: Json,
    /// Set by a later `revert_intervention` call.
    pub reverted: bool,
    /// When this record was created.
    pub created_at: DateTime<Utc>,
}

/// Executes Guardian interventions against tasks and agents, maintaining
/// the append-only audit log.
pub struct InterventionService {
    store: Arc<dyn ControlPlaneStore>,
    queue: Arc<TaskQueue>,
    bus: Arc<dyn EventBus>,
    settings: Arc<dyn ProjectSettingsResolver>,
    audit: DashMap<EntityId, Intervention>,
}

impl InterventionService {
    /// Construct an intervention service with a project settings resolver.
    pub fn new(
        store: Arc<dyn ControlPlaneStore>,
        queue: Arc<TaskQueue>,
        bus: Arc<dyn EventBus>,
        settings: Arc<dyn ProjectSettingsResolver>,
    ) -> Self {
        Self { store, queue, bus, settings, audit: DashMap::new() }
    }

    fn require_guardian(authority: Authority) -> Result<(), InterventionError> {
        if authority.satisfies(Authority::Guardian) {
            Ok(())
        } else {
            Err(InterventionError::InsufficientAuthority { required: Authority::Guardian, actual: authority })
        }
    }

    fn record(
        &self,
        action: &str,
        authority: Authority,
        initiated_by: &str,
        manual: bool,
        executed: bool,
        reason: &str,
        before: Json,
        after: Json,
    ) -> Intervention {
        let record = Intervention {
            id: EntityId::new(),
            action: action.to_string(),
            authority,
            initiated_by: initiated_by.to_string(),
            manual,
            executed,
            reason: reason.to_string(),
            before,
            after,
            reverted: false,
            created_at: Utc::now(),
        };
        self.audit.insert(record.id, record.clone());
        record
    }

    /// Cancel a task immediately with `error_message = "EMERGENCY
    /// CANCELLATION: <reason>"`.
    pub async fn emergency_cancel_task(
        &self,
        task: Task,
        reason: &str,
        authority: Authority,
        initiated_by: &str,
        manual: bool,
        project_id: Option<EntityId>,
    ) -> Result<Intervention, InterventionError> {
        Self::require_guardian(authority)?;
        let before = serde_json::json!({ "status": task.status, "error_message": task.error_message });

        if !manual && !self.settings.guardian_auto_steering(project_id) {
            return Ok(self.record(
                "emergency_cancel_task",
                authority,
                initiated_by,
                manual,
                false,
                reason,
                before.clone(),
                before,
            ));
        }

        let task_id = task.id;
        let updated = self
            .queue
            .update_task_status(
                task,
                foreman_types::TaskStatus::Failed,
                None,
                Some(format!("EMERGENCY CANCELLATION: {reason}")),
                None,
            )
            .await?;
        let after = serde_json::json!({ "status": updated.status, "error_message": updated.error_message });

        let _ = self.bus.publish(&SystemEvent::with_payload(
            EventType::GuardianInterventionStarted,
            "task",
            task_id,
            serde_json::json!({ "action": "emergency_cancel_task", "reason": reason }),
        ));

        Ok(self.record("emergency_cancel_task", authority, initiated_by, manual, true, reason, before, after))
    }

    /// Move `n` units of capacity from one agent to another.
    #[allow(clippy::too_many_arguments)]
    pub async fn reallocate_agent_capacity(
        &self,
        mut from: Agent,
        mut to: Agent,
        n: u32,
        reason: &str,
        authority: Authority,
        initiated_by: &str,
        manual: bool,
        project_id: Option<EntityId>,
    ) -> Result<Intervention, InterventionError> {
        Self::require_guardian(authority)?;
        if n == 0 {
            return Err(InterventionError::ZeroAmount);
        }
        if from.capacity < n {
            return Err(InterventionError::InsufficientCapacity { n, available: from.capacity });
        }

        let before = serde_json::json!({
            "from_capacity": from.capacity,
            "to_capacity": to.capacity,
        });

        if !manual && !self.settings.guardian_auto_steering(project_id) {
            return Ok(self.record(
                "reallocate_agent_capacity",
                authority,
                initiated_by,
                manual,
                false,
                reason,
                before.clone(),
                before,
            ));
        }

        from.capacity -= n;
        to.capacity += n;
        self.store.update_agent(&from).await?;
        self.store.update_agent(&to).await?;

        let after = serde_json::json!({
            "from_capacity": from.capacity,
            "to_capacity": to.capacity,
        });

        let _ = self.bus.publish(&SystemEvent::with_payload(
            EventType::GuardianResourceReallocated,
            "agent",
            from.id,
            serde_json::json!({ "to": to.id, "n": n, "reason": reason }),
        ));

        Ok(self.record("reallocate_agent_capacity", authority, initiated_by, manual, true, reason, before, after))
    }

    /// Override a task's scheduling priority.
    pub async fn override_task_priority(
        &self,
        mut task: Task,
        new_priority: TicketPriority,
        reason: &str,
        authority: Authority,
        initiated_by: &str,
        manual: bool,
        project_id: Option<EntityId>,
    ) -> Result<Intervention, InterventionError> {
        Self::require_guardian(authority)?;
        let before = serde_json::json!({ "priority": task.priority });

        if !manual && !self.settings.guardian_auto_steering(project_id) {
            return Ok(self.record(
                "override_task_priority",
                authority,
                initiated_by,
                manual,
                false,
                reason,
                before.clone(),
                before,
            ));
        }

        let task_id = task.id;
        task.priority = new_priority;
        task.updated_at = Utc::now();
        self.store.update_task(&task).await?;
        let after = serde_json::json!({ "priority": task.priority });

        let _ = self.bus.publish(&SystemEvent::with_payload(
            EventType::GuardianInterventionCompleted,
            "task",
            task_id,
            serde_json::json!({ "action": "override_task_priority", "reason": reason }),
        ));

        Ok(self.record("override_task_priority", authority, initiated_by, manual, true, reason, before, after))
    }

    /// Mark a prior intervention reverted. Does not itself undo the
    /// business state change; that's left to a follow-up action.
    pub async fn revert_intervention(
        &self,
        action_id: EntityId,
        reason: &str,
        initiated_by: &str,
        authority: Authority,
    ) -> Result<Intervention, InterventionError> {
        Self::require_guardian(authority)?;
        let mut entry = self.audit.get_mut(&action_id).ok_or(InterventionError::NotFound(action_id))?;
        entry.reverted = true;
        let reverted = entry.clone();
        drop(entry);

        let _ = self.bus.publish(&SystemEvent::with_payload(
            EventType::GuardianInterventionReverted,
            "intervention",
            action_id,
            serde_json::json!({ "reason": reason, "initiated_by": initiated_by }),
        ));

        Ok(reverted)
    }

    /// Look up an audit record by action id.
    pub fn get(&self, action_id: EntityId) -> Option<Intervention> {
        self.audit.get(&action_id).map(|entry| entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_bus::InMemoryBus;
    use foreman_store_memory::MemoryStore;
    use foreman_types::{Ticket, TicketPriority};

    struct NeverAutoSteer;
    impl ProjectSettingsResolver for NeverAutoSteer {
        fn guardian_auto_steering(&self, _project_id: Option<EntityId>) -> bool {
            false
        }
    }

    fn harness(resolver: Arc<dyn ProjectSettingsResolver>) -> InterventionService {
        let store: Arc<dyn ControlPlaneStore> = Arc::new(MemoryStore::new());
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new(64));
        let queue = Arc::new(TaskQueue::new(store.clone(), bus.clone()));
        InterventionService::new(store, queue, bus, resolver)
    }

    async fn make_task(service: &InterventionService) -> Task {
        let ticket =
            Ticket::new("t", "d", "backend", TicketPriority::Medium, EntityId::new(), EntityId::new()).unwrap();
        service.store.insert_ticket(&ticket).await.unwrap();
        let task = Task::new(
            ticket.id,
            "backend",
            "implement_feature",
            "t",
            "d",
            TicketPriority::Medium,
            foreman_types::TaskDependencies::none(),
        );
        service.store.insert_task(&task).await.unwrap();
        task
    }

    #[test]
    fn worker_authority_is_rejected() {
        let err = InterventionService::require_guardian(Authority::Worker).unwrap_err();
        assert!(matches!(err, InterventionError::InsufficientAuthority { .. }));
    }

    #[tokio::test]
    async fn emergency_cancel_marks_task_failed_with_reason() {
        let service = harness(Arc::new(AlwaysAutoSteering));
        let task = make_task(&service).await;

        let record = service
            .emergency_cancel_task(task.clone(), "runaway loop", Authority::Guardian, "guardian", false, None)
            .await
            .unwrap();
        assert!(record.executed);

        let stored = service.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, foreman_types::TaskStatus::Failed);
        assert!(stored.error_message.unwrap().contains("EMERGENCY CANCELLATION"));
    }

    #[tokio::test]
    async fn disabled_auto_steering_audits_without_applying() {
        let service = harness(Arc::new(NeverAutoSteer));
        let task = make_task(&service).await;

        let record = service
            .emergency_cancel_task(task.clone(), "runaway loop", Authority::Guardian, "guardian", false, None)
            .await
            .unwrap();
        assert!(!record.executed);

        let stored = service.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, foreman_types::TaskStatus::Pending);
    }

    #[tokio::test]
    async fn manual_bypasses_disabled_auto_steering() {
        let service = harness(Arc::new(NeverAutoSteer));
        let task = make_task(&service).await;

        let record = service
            .emergency_cancel_task(task.clone(), "operator request", Authority::Guardian, "operator", true, None)
            .await
            .unwrap();
        assert!(record.executed);
    }

    #[tokio::test]
    async fn revert_marks_a_prior_action_reverted() {
        let service = harness(Arc::new(AlwaysAutoSteering));
        let task = make_task(&service).await;
        let record = service
            .emergency_cancel_task(task, "bad loop", Authority::Guardian, "guardian", false, None)
            .await
            .unwrap();

        let reverted = service.revert_intervention(record.id, "false alarm", "operator", Authority::Guardian).await.unwrap();
        assert!(reverted.reverted);
    }
}
