#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **foreman-bus** – Typed event bus for the Foreman control plane.
//!
//! Provides the at-least-once, per-topic fan-out described in the control
//! plane's event bus contract: process-local subscribers via an in-memory
//! broadcast channel, plus a [`PubSubPublisher`] trait for forwarding the
//! same events to a cross-process channel named `events.<event_type>`.
//!
//! Delivery is advisory: `publish` never blocks on slow subscribers, and a
//! handler that errors does not prevent other subscribers from receiving
//! the event.

use std::sync::Arc;

use anyhow::Result;
use foreman_types::EntityId;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::broadcast;

/// The canonical set of event types the control plane emits, drawn from the
/// bus contract's known-tag list. `Monitoring` carries its dotted suffix
/// (`monitoring.<suffix>`) since that family is open-ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum EventType {
    /// A task was claimed and bound to an agent.
    #[serde(rename = "TASK_ASSIGNED")]
    TaskAssigned,
    /// A task reached `completed`.
    #[serde(rename = "TASK_COMPLETED")]
    TaskCompleted,
    /// A task reached `failed`.
    #[serde(rename = "TASK_FAILED")]
    TaskFailed,
    /// A task entered `pending_validation`.
    #[serde(rename = "TASK_VALIDATION_REQUESTED")]
    TaskValidationRequested,
    /// A validator run passed.
    #[serde(rename = "TASK_VALIDATION_PASSED")]
    TaskValidationPassed,
    /// A validator run failed.
    #[serde(rename = "TASK_VALIDATION_FAILED")]
    TaskValidationFailed,
    /// Any task status transition.
    #[serde(rename = "TASK_STATUS_CHANGED")]
    TaskStatusChanged,
    /// A task was reaped for exceeding `timeout_seconds`.
    #[serde(rename = "TASK_TIMED_OUT")]
    TaskTimedOut,
    /// A ticket was created.
    #[serde(rename = "TICKET_CREATED")]
    TicketCreated,
    /// A ticket entered `approval_status = pending_review`.
    #[serde(rename = "TICKET_APPROVAL_PENDING")]
    TicketApprovalPending,
    /// A ticket's approval was granted.
    #[serde(rename = "TICKET_APPROVED")]
    TicketApproved,
    /// A ticket's approval was rejected.
    #[serde(rename = "TICKET_REJECTED")]
    TicketRejected,
    /// Any ticket status transition.
    #[serde(rename = "TICKET_STATUS_CHANGED")]
    TicketStatusChanged,
    /// An agent completed registration.
    #[serde(rename = "AGENT_REGISTERED")]
    AgentRegistered,
    /// An agent was restarted by the registry/restart orchestrator.
    #[serde(rename = "AGENT_RESTARTED")]
    AgentRestarted,
    /// An agent's capability set changed.
    #[serde(rename = "agent.capability.updated")]
    AgentCapabilityUpdated,
    /// A generic agent-sourced event (free-form payload).
    #[serde(rename = "agent.event")]
    AgentEvent,
    /// A sandbox was spawned for a task.
    #[serde(rename = "SANDBOX_SPAWNED")]
    SandboxSpawned,
    /// A sandbox was terminated for being idle past the threshold.
    #[serde(rename = "SANDBOX_TERMINATED_IDLE")]
    SandboxTerminatedIdle,
    /// A sync point was created.
    #[serde(rename = "coordination.sync.created")]
    CoordinationSyncCreated,
    /// A sync point's participants all arrived.
    #[serde(rename = "coordination.sync.ready")]
    CoordinationSyncReady,
    /// A split fanned a task out into parallel tasks.
    #[serde(rename = "coordination.split.created")]
    CoordinationSplitCreated,
    /// A join was registered awaiting its source tasks.
    #[serde(rename = "coordination.join.created")]
    CoordinationJoinCreated,
    /// A synthesis (merge) completed successfully.
    #[serde(rename = "coordination.synthesis.completed")]
    CoordinationSynthesisCompleted,
    /// A synthesis (merge) failed.
    #[serde(rename = "coordination.synthesis.failed")]
    CoordinationSynthesisFailed,
    /// A merge strategy finished combining task results.
    #[serde(rename = "coordination.merge.completed")]
    CoordinationMergeCompleted,
    /// A cost record was persisted.
    #[serde(rename = "cost.recorded")]
    CostRecorded,
    /// A budget crossed its alert threshold.
    #[serde(rename = "cost.budget.warning")]
    CostBudgetWarning,
    /// A budget was exceeded.
    #[serde(rename = "cost.budget.exceeded")]
    CostBudgetExceeded,
    /// A new budget was created.
    #[serde(rename = "budget.created")]
    BudgetCreated,
    /// An alert fired.
    #[serde(rename = "alert.triggered")]
    AlertTriggered,
    /// An alert was acknowledged by an operator.
    #[serde(rename = "alert.acknowledged")]
    AlertAcknowledged,
    /// An alert was resolved.
    #[serde(rename = "alert.resolved")]
    AlertResolved,
    /// A Guardian intervention began.
    #[serde(rename = "guardian.intervention.started")]
    GuardianInterventionStarted,
    /// A Guardian intervention completed.
    #[serde(rename = "guardian.intervention.completed")]
    GuardianInterventionCompleted,
    /// A Guardian intervention was reverted.
    #[serde(rename = "guardian.intervention.reverted")]
    GuardianInterventionReverted,
    /// A Guardian reallocated resources as part of an intervention.
    #[serde(rename = "guardian.resource.reallocated")]
    GuardianResourceReallocated,
    /// A sandbox preview became reachable.
    #[serde(rename = "PREVIEW_READY")]
    PreviewReady,
    /// A pull request was opened.
    #[serde(rename = "PR_OPENED")]
    PrOpened,
    /// A pull request was merged.
    #[serde(rename = "PR_MERGED")]
    PrMerged,
    /// A pull request was closed without merging.
    #[serde(rename = "PR_CLOSED")]
    PrClosed,
    /// A commit was linked to a task.
    #[serde(rename = "COMMIT_LINKED")]
    CommitLinked,
    /// A spec-driven execution run began.
    #[serde(rename = "SPEC_EXECUTION_STARTED")]
    SpecExecutionStarted,
    /// Open-ended monitoring-loop events, named `monitoring.<suffix>`.
    #[serde(rename = "monitoring")]
    Monitoring {
        /// The dotted suffix after `monitoring.`.
        suffix: String,
    },
}

impl EventType {
    /// The exact wire tag for this event type, as it appears in
    /// `event_type` and in the `events.<event_type>` channel name.
    pub fn wire_tag(&self) -> String {
        match self {
            EventType::TaskAssigned => "TASK_ASSIGNED".into(),
            EventType::TaskCompleted => "TASK_COMPLETED".into(),
            EventType::TaskFailed => "TASK_FAILED".into(),
            EventType::TaskValidationRequested => "TASK_VALIDATION_REQUESTED".into(),
            EventType::TaskValidationPassed => "TASK_VALIDATION_PASSED".into(),
            EventType::TaskValidationFailed => "TASK_VALIDATION_FAILED".into(),
            EventType::TaskStatusChanged => "TASK_STATUS_CHANGED".into(),
            EventType::TaskTimedOut => "TASK_TIMED_OUT".into(),
            EventType::TicketCreated => "TICKET_CREATED".into(),
            EventType::TicketApprovalPending => "TICKET_APPROVAL_PENDING".into(),
            EventType::TicketApproved => "TICKET_APPROVED".into(),
            EventType::TicketRejected => "TICKET_REJECTED".into(),
            EventType::TicketStatusChanged => "TICKET_STATUS_CHANGED".into(),
            EventType::AgentRegistered => "AGENT_REGISTERED".into(),
            EventType::AgentRestarted => "AGENT_RESTARTED".into(),
            EventType::AgentCapabilityUpdated => "agent.capability.updated".into(),
            EventType::AgentEvent => "agent.event".into(),
            EventType::SandboxSpawned => "SANDBOX_SPAWNED".into(),
            EventType::SandboxTerminatedIdle => "SANDBOX_TERMINATED_IDLE".into(),
            EventType::CoordinationSyncCreated => "coordination.sync.created".into(),
            EventType::CoordinationSyncReady => "coordination.sync.ready".into(),
            EventType::CoordinationSplitCreated => "coordination.split.created".into(),
            EventType::CoordinationJoinCreated => "coordination.join.created".into(),
            EventType::CoordinationSynthesisCompleted => "coordination.synthesis.completed".into(),
            EventType::CoordinationSynthesisFailed => "coordination.synthesis.failed".into(),
            EventType::CoordinationMergeCompleted => "coordination.merge.completed".into(),
            EventType::CostRecorded => "cost.recorded".into(),
            EventType::CostBudgetWarning => "cost.budget.warning".into(),
            EventType::CostBudgetExceeded => "cost.budget.exceeded".into(),
            EventType::BudgetCreated => "budget.created".into(),
            EventType::AlertTriggered => "alert.triggered".into(),
            EventType::AlertAcknowledged => "alert.acknowledged".into(),
            EventType::AlertResolved => "alert.resolved".into(),
            EventType::GuardianInterventionStarted => "guardian.intervention.started".into(),
            EventType::GuardianInterventionCompleted => "guardian.intervention.completed".into(),
            EventType::GuardianInterventionReverted => "guardian.intervention.reverted".into(),
            EventType::GuardianResourceReallocated => "guardian.resource.reallocated".into(),
            EventType::PreviewReady => "PREVIEW_READY".into(),
            EventType::PrOpened => "PR_OPENED".into(),
            EventType::PrMerged => "PR_MERGED".into(),
            EventType::PrClosed => "PR_CLOSED".into(),
            EventType::CommitLinked => "COMMIT_LINKED".into(),
            EventType::SpecExecutionStarted => "SPEC_EXECUTION_STARTED".into(),
            EventType::Monitoring { suffix } => format!("monitoring.{suffix}"),
        }
    }

    /// The cross-process pub/sub channel name this event publishes on:
    /// `events.<event_type>`.
    pub fn channel_name(&self) -> String {
        format!("events.{}", self.wire_tag())
    }
}

/// A system event: the unit of exchange on the bus. Mirrors the bus
/// contract's shape: `{event_type, entity_type, entity_id, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemEvent {
    /// What kind of event this is.
    pub event_type: EventType,
    /// The kind of entity this event concerns, e.g. `"task"`, `"agent"`.
    pub entity_type: String,
    /// The id of the entity this event concerns.
    pub entity_id: EntityId,
    /// Free-form JSON payload.
    pub payload: Json,
}

impl SystemEvent {
    /// Construct a new event with an empty object payload.
    pub fn new(event_type: EventType, entity_type: impl Into<String>, entity_id: EntityId) -> Self {
        Self { event_type, entity_type: entity_type.into(), entity_id, payload: Json::Object(Default::default()) }
    }

    /// Construct a new event with the given payload.
    pub fn with_payload(
        event_type: EventType,
        entity_type: impl Into<String>,
        entity_id: EntityId,
        payload: Json,
    ) -> Self {
        Self { event_type, entity_type: entity_type.into(), entity_id, payload }
    }
}

/// Core event bus abstraction for publishing and subscribing to system
/// events.
///
/// Implementations must be thread-safe, non-blocking on `publish`, and
/// support multiple concurrent subscribers. Delivery is at-least-once and
/// ordered per-topic within a single publisher process; no ordering is
/// guaranteed across topics.
pub trait EventBus: Send + Sync {
    /// Publish an event to all subscribers. Never blocks on a slow
    /// subscriber; a full ring buffer drops the oldest unread event instead.
    fn publish(&self, event: &SystemEvent) -> Result<()>;

    /// Subscribe to the live event stream. The returned receiver observes
    /// only events published after the call.
    fn subscribe(&self) -> broadcast::Receiver<SystemEvent>;
}

/// Simple in-memory, broadcast-only event bus using Tokio channels.
#[derive(Debug, Clone)]
pub struct InMemoryBus {
    tx: Arc<broadcast::Sender<SystemEvent>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InMemoryBus {
    /// Create a new in-memory bus with the given ring buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx: Arc::new(tx) }
    }

    /// Current number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventBus for InMemoryBus {
    fn publish(&self, event: &SystemEvent) -> Result<()> {
        // A `SendError` here just means there are no subscribers; that is
        // not a failure the caller needs to react to.
        let _ = self.tx.send(event.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }
}

/// Adapter for forwarding events to an external pub/sub backend on the
/// `events.<event_type>` channel convention. Implemented outside this crate
/// by whatever backend a deployment chooses (Redis, NATS, …); kept as a
/// trait here so `foreman-orchestrator`/`foreman-cli` can wire a concrete
/// implementation without this crate depending on one.
#[async_trait::async_trait]
pub trait PubSubPublisher: Send + Sync {
    /// Publish `event` to its `events.<event_type>` channel. A transient
    /// backend failure (unreachable broker) should be logged by the caller
    /// and not propagated as a hard error — events are advisory except
    /// where the component consuming them documents otherwise.
    async fn publish_external(&self, event: &SystemEvent) -> Result<(), BusError>;
}

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The cross-process backend could not be reached.
    #[error("pub/sub backend unreachable: {0}")]
    BackendUnreachable(String),
    /// The event could not be serialized for the wire.
    #[error("failed to encode event: {0}")]
    EncodingFailed(String),
}
