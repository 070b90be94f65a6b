//! Shared application state handed to every route via axum's `State` extractor.

use std::sync::Arc;

use dashmap::DashMap;
use foreman_bus::{EventBus, SystemEvent};
use foreman_cost::alerting::AlertService;
use foreman_queue::TaskQueue;
use foreman_sandbox::SandboxGateway;
use foreman_store_core::ControlPlaneStore;
use foreman_types::EntityId;
use tokio::sync::RwLock;

/// A VCS commit linked to a ticket via `/api/v1/commits/ticket/{id}/link`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CommitLink {
    /// Commit SHA.
    pub sha: String,
    /// Ticket the commit is linked to.
    pub ticket_id: EntityId,
    /// Repository the commit lives in, `owner/name`.
    pub repo: String,
    /// When the link was recorded.
    pub linked_at: chrono::DateTime<chrono::Utc>,
}

/// Rolling per-sandbox event buffer backing `GET /sandboxes/{id}/events`.
/// The bus itself is fire-and-forget broadcast with no replay, so the API
/// layer keeps its own short-lived tail the way a dashboard would.
pub struct EventLog {
    buffers: DashMap<String, Vec<SystemEvent>>,
    capacity: usize,
}

impl EventLog {
    fn new(capacity: usize) -> Self {
        Self { buffers: DashMap::new(), capacity }
    }

    fn record(&self, sandbox_id: &str, event: SystemEvent) {
        let mut buffer = self.buffers.entry(sandbox_id.to_string()).or_default();
        buffer.push(event);
        let len = buffer.len();
        if len > self.capacity {
            buffer.drain(0..len - self.capacity);
        }
    }

    /// The buffered events for `sandbox_id`, oldest first.
    pub fn events_for(&self, sandbox_id: &str) -> Vec<SystemEvent> {
        self.buffers.get(sandbox_id).map(|entry| entry.clone()).unwrap_or_default()
    }
}

/// Everything a route handler needs, cloned cheaply per request.
#[derive(Clone)]
pub struct ApiState {
    /// Control-plane persistence.
    pub store: Arc<dyn ControlPlaneStore>,
    /// Task queue (enqueue / claim / status transitions).
    pub queue: Arc<TaskQueue>,
    /// Event bus, used both to publish and to seed the WebSocket fan-out.
    pub bus: Arc<dyn EventBus>,
    /// Sandbox gateway, if this deployment wires one in.
    pub sandbox: Option<Arc<dyn SandboxGateway>>,
    /// Budget alert service.
    pub alerts: Arc<AlertService>,
    /// Commit links, keyed by sha and by ticket.
    pub commits: Arc<RwLock<Vec<CommitLink>>>,
    /// Recent per-sandbox event tail for the events endpoint.
    pub event_log: Arc<EventLog>,
}

impl ApiState {
    /// Construct state over the given collaborators. `sandbox` may be
    /// `None` in deployments that run the legacy (non-sandboxed) worker.
    pub fn new(
        store: Arc<dyn ControlPlaneStore>,
        queue: Arc<TaskQueue>,
        bus: Arc<dyn EventBus>,
        sandbox: Option<Arc<dyn SandboxGateway>>,
        alerts: Arc<AlertService>,
    ) -> Self {
        Self {
            store,
            queue,
            bus,
            sandbox,
            alerts,
            commits: Arc::new(RwLock::new(Vec::new())),
            event_log: Arc::new(EventLog::new(200)),
        }
    }

    /// Spawn the background task that tails the bus into the per-sandbox
    /// event log, keyed by the `sandbox_id` field carried in event
    /// payloads (events that don't name one are ignored).
    pub fn spawn_event_log_tail(&self) {
        let bus = self.bus.clone();
        let event_log = self.event_log.clone();
        tokio::spawn(async move {
            let mut rx = bus.subscribe();
            while let Ok(event) = rx.recv().await {
                if let Some(sandbox_id) = event.payload.get("sandbox_id").and_then(|v| v.as_str()) {
                    event_log.record(sandbox_id, event);
                }
            }
        });
    }
}
