//! Idle sandbox monitor (§4.9): reaps sandboxes that stopped making
//! progress.
//!
//! Tracks per-sandbox heartbeat and most-recent-work-event timestamps from
//! the `agent.event` stream (mirrors the teacher's `ProgressMonitor`
//! DashMap-of-trackers shape), and periodically sweeps for sandboxes that
//! are alive (heartbeat within [`ALIVE_WINDOW`]) but have made no work
//! progress within [`DEFAULT_IDLE_THRESHOLD`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use foreman_bus::{EventBus, EventType, SystemEvent};
use foreman_sandbox::{event_kind, SandboxEventKind, SandboxGateway};
use foreman_store_core::{ControlPlaneStore, TaskFilter};
use foreman_types::{EntityId, TaskStatus};
use tracing::{info, warn};

use crate::OrchestratorError;
use foreman_queue::{QueueError, TaskQueue};

/// How recent a heartbeat must be for a sandbox to count as alive.
pub const ALIVE_WINDOW: chrono::Duration = chrono::Duration::seconds(90);

/// How long a sandbox may go without a work event before it's reaped.
pub const DEFAULT_IDLE_THRESHOLD: chrono::Duration = chrono::Duration::minutes(3);

/// Cadence between sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct SandboxTracker {
    agent_id: EntityId,
    last_heartbeat: DateTime<Utc>,
    last_work_event: Option<DateTime<Utc>>,
}

/// Periodically reaps sandboxes that have stopped making progress.
/// [`Self::observe`] is fed every `agent.event` the bus carries;
/// [`Self::run`] drives the sweep loop.
pub struct IdleSandboxMonitor {
    tracked: DashMap<String, SandboxTracker>,
    sandbox: Arc<dyn SandboxGateway>,
    store: Arc<dyn ControlPlaneStore>,
    queue: Arc<TaskQueue>,
    bus: Arc<dyn EventBus>,
    idle_threshold: chrono::Duration,
}

impl IdleSandboxMonitor {
    /// Construct a monitor using the default (3 minute) idle threshold.
    pub fn new(
        sandbox: Arc<dyn SandboxGateway>,
        store: Arc<dyn ControlPlaneStore>,
        queue: Arc<TaskQueue>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self::with_idle_threshold(sandbox, store, queue, bus, DEFAULT_IDLE_THRESHOLD)
    }

    /// Construct a monitor with a caller-supplied idle threshold.
    pub fn with_idle_threshold(
        sandbox: Arc<dyn SandboxGateway>,
        store: Arc<dyn ControlPlaneStore>,
        queue: Arc<TaskQueue>,
        bus: Arc<dyn EventBus>,
        idle_threshold: chrono::Duration,
    ) -> Self {
        Self { tracked: DashMap::new(), sandbox, store, queue, bus, idle_threshold }
    }

    /// Feed a single bus event into the tracker. Events carrying no
    /// `sandbox_id` (nothing sandbox-sourced publishes outside `agent.event`)
    /// are ignored.
    pub fn observe(&self, event: &SystemEvent) {
        if event.event_type != EventType::AgentEvent {
            return;
        }
        let Some(sandbox_id) = event.payload.get("sandbox_id").and_then(|v| v.as_str()) else {
            return;
        };
        let Some(kind) = event_kind(event) else {
            return;
        };
        let observed_at = Utc::now();

        let mut tracker = self.tracked.entry(sandbox_id.to_string()).or_insert(SandboxTracker {
            agent_id: event.entity_id,
            last_heartbeat: observed_at,
            last_work_event: None,
        });
        tracker.last_heartbeat = observed_at;
        if kind.is_work_event() {
            tracker.last_work_event = Some(observed_at);
        }
    }

    /// Drop a sandbox from tracking, e.g. once it has been reaped.
    fn forget(&self, sandbox_id: &str) {
        self.tracked.remove(sandbox_id);
    }

    /// Run forever: feed every bus event into [`Self::observe`] and sweep
    /// every [`SWEEP_INTERVAL`]. Intended to be spawned alongside
    /// [`crate::Orchestrator::run`].
    pub async fn run(&self) {
        let mut events = self.bus.subscribe();
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                event = events.recv() => {
                    if let Ok(event) = event {
                        self.observe(&event);
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep().await {
                        warn!(error = %err, "idle sandbox sweep failed");
                    }
                }
            }
        }
    }

    /// Run a single sweep, returning the sandbox ids that were reaped.
    pub async fn sweep(&self) -> Result<Vec<String>, OrchestratorError> {
        let now = Utc::now();
        let idle: Vec<(String, SandboxTracker)> = self
            .tracked
            .iter()
            .filter(|entry| now - entry.last_heartbeat <= ALIVE_WINDOW)
            .filter(|entry| match entry.last_work_event {
                None => true,
                Some(at) => now - at > self.idle_threshold,
            })
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut reaped = Vec::new();
        for (sandbox_id, tracker) in idle {
            self.reap(&sandbox_id, &tracker, now).await?;
            reaped.push(sandbox_id);
        }
        Ok(reaped)
    }

    async fn reap(
        &self,
        sandbox_id: &str,
        tracker: &SandboxTracker,
        now: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        let idle_for = tracker.last_work_event.unwrap_or(tracker.last_heartbeat);
        let idle_minutes = (now - idle_for).num_minutes().max(0);

        match self.sandbox.extract_session_transcript(sandbox_id).await {
            Ok(Some(transcript)) => {
                info!(sandbox_id, bytes = transcript.len(), "saved transcript before reaping idle sandbox");
            }
            Ok(None) => {}
            Err(err) => warn!(sandbox_id, error = %err, "transcript extraction failed, reaping anyway"),
        }

        if let Err(err) = self.sandbox.terminate_sandbox(sandbox_id).await {
            warn!(sandbox_id, error = %err, "sandbox termination failed, still marking task failed");
        }

        let tasks = self.store.list_tasks(TaskFilter::default()).await.map_err(QueueError::from)?;
        if let Some(task) = tasks.into_iter().find(|t| t.sandbox_id.as_deref() == Some(sandbox_id)) {
            self.queue
                .update_task_status(
                    task,
                    TaskStatus::Failed,
                    None,
                    Some(format!(
                        "Sandbox terminated: idle_timeout. Idle for {idle_minutes} minutes with no work progress."
                    )),
                    None,
                )
                .await?;
        }

        let _ = self.bus.publish(&SystemEvent::with_payload(
            EventType::SandboxTerminatedIdle,
            "sandbox",
            tracker.agent_id,
            serde_json::json!({ "sandbox_id": sandbox_id, "idle_minutes": idle_minutes }),
        ));

        self.forget(sandbox_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use foreman_bus::InMemoryBus;
    use foreman_sandbox::{sandbox_event, MessageType, PreviewLink, SandboxError, SpawnRequest};
    use foreman_store_memory::MemoryStore;
    use foreman_types::{Task, TaskDependencies, Ticket, TicketPriority};

    struct StubGateway {
        transcript: Option<String>,
    }

    #[async_trait]
    impl SandboxGateway for StubGateway {
        async fn spawn_for_task(&self, _request: SpawnRequest) -> Result<String, SandboxError> {
            Ok("sandbox-1".into())
        }
        async fn terminate_sandbox(&self, _sandbox_id: &str) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn extract_session_transcript(
            &self,
            _sandbox_id: &str,
        ) -> Result<Option<String>, SandboxError> {
            Ok(self.transcript.clone())
        }
        async fn get_preview_link(
            &self,
            _sandbox_id: &str,
            _port: u16,
        ) -> Result<PreviewLink, SandboxError> {
            Ok(PreviewLink { url: "http://localhost".into(), token: None })
        }
        async fn send_message(
            &self,
            _sandbox_id: &str,
            _content: &str,
            _message_type: MessageType,
        ) -> Result<(), SandboxError> {
            Ok(())
        }
    }

    fn harness() -> (IdleSandboxMonitor, Arc<dyn ControlPlaneStore>) {
        let store: Arc<dyn ControlPlaneStore> = Arc::new(MemoryStore::new());
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new(64));
        let queue = Arc::new(TaskQueue::new(store.clone(), bus.clone()));
        let gateway: Arc<dyn SandboxGateway> =
            Arc::new(StubGateway { transcript: Some("session transcript".into()) });
        let monitor = IdleSandboxMonitor::with_idle_threshold(
            gateway,
            store.clone(),
            queue,
            bus,
            chrono::Duration::seconds(0),
        );
        (monitor, store)
    }

    #[tokio::test]
    async fn sweep_reaps_alive_but_idle_sandbox_and_fails_its_task() {
        let (monitor, store) = harness();
        let ticket =
            Ticket::new("t", "d", "backend", TicketPriority::Medium, EntityId::new(), EntityId::new())
                .unwrap();
        store.insert_ticket(&ticket).await.unwrap();
        let mut task = Task::new(
            ticket.id,
            "backend",
            "implement_feature",
            "t",
            "d",
            TicketPriority::Medium,
            TaskDependencies::none(),
        );
        task.sandbox_id = Some("sandbox-1".into());
        store.insert_task(&task).await.unwrap();

        let agent_id = EntityId::new();
        monitor.observe(&sandbox_event(
            SandboxEventKind::Started,
            agent_id,
            "sandbox-1",
            serde_json::json!({}),
        ));

        let reaped = monitor.sweep().await.unwrap();
        assert_eq!(reaped, vec!["sandbox-1".to_string()]);

        let after = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(after.status, TaskStatus::Failed);
        assert!(after.error_message.as_deref().unwrap().contains("idle_timeout"));
        assert!(!monitor.tracked.contains_key("sandbox-1"));
    }

    #[tokio::test]
    async fn sweep_skips_sandboxes_with_a_recent_work_event() {
        let (monitor, _store) = harness();
        let monitor = IdleSandboxMonitor::with_idle_threshold(
            monitor.sandbox.clone(),
            monitor.store.clone(),
            monitor.queue.clone(),
            monitor.bus.clone(),
            chrono::Duration::minutes(3),
        );
        let agent_id = EntityId::new();
        monitor.observe(&sandbox_event(
            SandboxEventKind::FileEdited,
            agent_id,
            "sandbox-2",
            serde_json::json!({}),
        ));

        let reaped = monitor.sweep().await.unwrap();
        assert!(reaped.is_empty());
    }

    #[tokio::test]
    async fn sweep_ignores_stale_heartbeats_outside_the_alive_window() {
        let (monitor, _store) = harness();
        monitor.tracked.insert(
            "sandbox-3".into(),
            SandboxTracker {
                agent_id: EntityId::new(),
                last_heartbeat: Utc::now() - chrono::Duration::seconds(200),
                last_work_event: None,
            },
        );

        let reaped = monitor.sweep().await.unwrap();
        assert!(reaped.is_empty(), "heartbeat older than the 90s alive window is not reaped");
    }
}
