#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **foreman-orchestrator** – Orchestrator worker loop (§4.8) and idle
//! sandbox monitor (§4.9) for the Foreman control plane.
//!
//! [`Orchestrator`] is the long-running cooperative loop that claims tasks
//! off [`foreman_queue::TaskQueue`] and, depending on
//! [`ExecutionModeConfig`], either hands them to an already-running
//! external agent (`Legacy`) or spawns a sandbox for them (`Sandbox`).
//! [`idle_monitor::IdleSandboxMonitor`] periodically reaps sandboxes that
//! have stopped making progress.

pub mod idle_monitor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use foreman_bus::{EventBus, EventType, SystemEvent};
use foreman_queue::{QueueError, TaskQueue};
use foreman_registry::{AgentRegistry, RegistrationRequest, RegistryError};
use foreman_sandbox::{SandboxError, SandboxGateway, SpawnRequest};
use foreman_store_core::TaskClaimFilter;
use foreman_types::{AgentStatus, EntityId, Task, TaskStatus};

/// How the orchestrator hands a claimed task off to an agent.
#[derive(Clone)]
pub enum ExecutionModeConfig {
    /// Find an already-registered `IDLE` agent and hand it the task; the
    /// agent worker process is external to this crate.
    Legacy {
        /// Restrict claims to this phase, if set.
        phase: Option<String>,
    },
    /// Claim with no agent filter, register a synthetic agent, and spawn a
    /// sandbox for it via [`SandboxGateway`].
    Sandbox {
        /// Agent template tag to request, given `(phase, "implement"|"validate")`.
        agent_type_for_phase: fn(&str, &str) -> String,
    },
}

/// Errors raised while running one orchestrator cycle.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The task queue failed.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// The agent registry failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// The sandbox gateway failed.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Cadence applied between polling cycles (§4.8): tight looping while the
/// queue keeps yielding work, a fixed sleep once it runs dry.
pub const EMPTY_QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Long-running cooperative loop claiming tasks and dispatching them per
/// [`ExecutionModeConfig`]. Call [`Orchestrator::run`] in a spawned task;
/// a `SIGTERM`/`SIGINT` handler should call [`Orchestrator::request_shutdown`]
/// to drain gracefully (finish the in-flight cycle, then exit).
pub struct Orchestrator {
    queue: Arc<TaskQueue>,
    registry: Arc<AgentRegistry>,
    sandbox: Arc<dyn SandboxGateway>,
    bus: Arc<dyn EventBus>,
    mode: ExecutionModeConfig,
    shutdown: Arc<AtomicBool>,
}

impl Orchestrator {
    /// Construct an orchestrator wired to its collaborators.
    pub fn new(
        queue: Arc<TaskQueue>,
        registry: Arc<AgentRegistry>,
        sandbox: Arc<dyn SandboxGateway>,
        bus: Arc<dyn EventBus>,
        mode: ExecutionModeConfig,
    ) -> Self {
        Self { queue, registry, sandbox, bus, mode, shutdown: Arc::new(AtomicBool::new(false)) }
    }

    /// A clone of the shutdown flag, for a signal handler to flip.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Request a graceful drain: the loop finishes any in-flight cycle and
    /// exits before its next sleep.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Run the polling loop until [`Self::request_shutdown`] is observed.
    pub async fn run(&self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.run_cycle().await {
                Ok(true) => continue,
                Ok(false) => tokio::time::sleep(EMPTY_QUEUE_POLL_INTERVAL).await,
                Err(err) => {
                    tracing::warn!(error = %err, "orchestrator cycle failed");
                    tokio::time::sleep(EMPTY_QUEUE_POLL_INTERVAL).await;
                }
            }
        }
        tracing::info!("orchestrator drained, exiting");
    }

    /// Run a single claim-and-dispatch cycle. Returns `true` if a task was
    /// claimed (caller should loop tightly) or `false` on an empty queue
    /// (caller should back off).
    pub async fn run_cycle(&self) -> Result<bool, OrchestratorError> {
        match &self.mode {
            ExecutionModeConfig::Legacy { phase } => self.run_legacy_cycle(phase.clone()).await,
            ExecutionModeConfig::Sandbox { agent_type_for_phase } => {
                self.run_sandbox_cycle(*agent_type_for_phase).await
            }
        }
    }

    async fn run_legacy_cycle(&self, phase: Option<String>) -> Result<bool, OrchestratorError> {
        let idle = self.registry.search_agents(&[], phase.as_deref(), None, 1, false).await?;
        let Some(agent) = idle.into_iter().find(|a| a.status == AgentStatus::Idle) else {
            return Ok(false);
        };

        let filter =
            TaskClaimFilter { phase, agent_capabilities: Some(agent.capabilities.clone()) };
        let Some(task) = self.queue.get_next_task(filter).await? else {
            return Ok(false);
        };

        self.queue.assign_task(task, &agent).await?;
        Ok(true)
    }

    async fn run_sandbox_cycle(
        &self,
        agent_type_for_phase: fn(&str, &str) -> String,
    ) -> Result<bool, OrchestratorError> {
        let Some(task) = self.queue.get_next_task(TaskClaimFilter::default()).await? else {
            return Ok(false);
        };

        let task_kind = if task.task_type == "validate" { "validate" } else { "implement" };
        let agent_type = agent_type_for_phase(&task.phase, task_kind);

        let identity = self
            .registry
            .register_agent(RegistrationRequest {
                agent_type,
                phase: task.phase.clone(),
                capabilities: vec![task.phase.clone()],
                capacity: 1,
                version: "1.0.0".into(),
                config: None,
                resource_requirements: None,
                expected_checksum: None,
                observed_checksum: None,
                requested_status: None,
            })
            .await?;

        if let Err(err) = self.spawn_and_assign(task.clone(), identity.agent.id).await {
            self.queue
                .update_task_status(
                    task,
                    TaskStatus::Failed,
                    None,
                    Some(format!("Sandbox spawn failed: {err}")),
                    None,
                )
                .await?;
        }

        Ok(true)
    }

    async fn spawn_and_assign(
        &self,
        mut task: Task,
        agent_id: EntityId,
    ) -> Result<(), OrchestratorError> {
        let sandbox_id = self
            .sandbox
            .spawn_for_task(SpawnRequest {
                task_id: task.id,
                agent_id,
                phase_id: task.phase.clone(),
                agent_type: task.task_type.clone(),
                extra_env: None,
                runtime: None,
                execution_mode: None,
            })
            .await?;

        task.sandbox_id = Some(sandbox_id.clone());
        if let Some(agent) =
            self.registry.search_agents(&[], None, None, 1, true).await?.into_iter().find(|a| a.id == agent_id)
        {
            self.queue.assign_task(task, &agent).await?;
        }

        let _ = self.bus.publish(&SystemEvent::with_payload(
            EventType::SandboxSpawned,
            "sandbox",
            agent_id,
            serde_json::json!({ "sandbox_id": sandbox_id }),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use foreman_bus::InMemoryBus;
    use foreman_sandbox::{MessageType, PreviewLink};
    use foreman_store_core::ControlPlaneStore;
    use foreman_store_memory::MemoryStore;
    use foreman_types::{Agent, TaskDependencies, Ticket, TicketPriority};
    use std::sync::atomic::AtomicUsize;

    struct StubGateway {
        spawned: AtomicUsize,
    }

    #[async_trait]
    impl SandboxGateway for StubGateway {
        async fn spawn_for_task(&self, _request: SpawnRequest) -> Result<String, SandboxError> {
            let n = self.spawned.fetch_add(1, Ordering::SeqCst);
            Ok(format!("sandbox-{n}"))
        }
        async fn terminate_sandbox(&self, _sandbox_id: &str) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn extract_session_transcript(
            &self,
            _sandbox_id: &str,
        ) -> Result<Option<String>, SandboxError> {
            Ok(None)
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

    fn harness() -> (Orchestrator, Arc<dyn ControlPlaneStore>) {
        let store: Arc<dyn ControlPlaneStore> = Arc::new(MemoryStore::new());
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new(64));
        let queue = Arc::new(TaskQueue::new(store.clone(), bus.clone()));
        let registry = Arc::new(AgentRegistry::new(store.clone(), bus.clone()));
        let gateway: Arc<dyn SandboxGateway> = Arc::new(StubGateway { spawned: AtomicUsize::new(0) });
        let orchestrator = Orchestrator::new(
            queue,
            registry,
            gateway,
            bus,
            ExecutionModeConfig::Sandbox { agent_type_for_phase: |_phase, kind| format!("claude-code-{kind}") },
        );
        (orchestrator, store)
    }

    #[tokio::test]
    async fn sandbox_cycle_claims_spawns_and_assigns() {
        let (orchestrator, store) = harness();
        let ticket =
            Ticket::new("t", "d", "backend", TicketPriority::Medium, EntityId::new(), EntityId::new())
                .unwrap();
        store.insert_ticket(&ticket).await.unwrap();
        let task = Task::new(
            ticket.id,
            "backend",
            "implement_feature",
            "t",
            "d",
            TicketPriority::Medium,
            TaskDependencies::none(),
        );
        store.insert_task(&task).await.unwrap();

        let claimed = orchestrator.run_cycle().await.unwrap();
        assert!(claimed);

        let after = store.get_task(task.id).await.unwrap().unwrap();
        assert!(after.sandbox_id.is_some());
        assert_eq!(after.status, TaskStatus::Assigned);
    }

    #[tokio::test]
    async fn empty_queue_reports_no_claim() {
        let (orchestrator, _store) = harness();
        assert!(!orchestrator.run_cycle().await.unwrap());
    }

    #[tokio::test]
    async fn legacy_cycle_requires_an_idle_agent() {
        let store: Arc<dyn ControlPlaneStore> = Arc::new(MemoryStore::new());
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new(64));
        let queue = Arc::new(TaskQueue::new(store.clone(), bus.clone()));
        let registry = Arc::new(AgentRegistry::new(store.clone(), bus.clone()));
        let gateway: Arc<dyn SandboxGateway> = Arc::new(StubGateway { spawned: AtomicUsize::new(0) });
        let orchestrator = Orchestrator::new(
            queue,
            registry,
            gateway,
            bus,
            ExecutionModeConfig::Legacy { phase: Some("backend".into()) },
        );

        let ticket =
            Ticket::new("t", "d", "backend", TicketPriority::Medium, EntityId::new(), EntityId::new())
                .unwrap();
        store.insert_ticket(&ticket).await.unwrap();
        let task = Task::new(
            ticket.id,
            "backend",
            "implement_feature",
            "t",
            "d",
            TicketPriority::Medium,
            TaskDependencies::none(),
        );
        store.insert_task(&task).await.unwrap();

        assert!(!orchestrator.run_cycle().await.unwrap(), "no idle agent registered yet");

        let mut agent = Agent::new("claude-code", "backend", "claude-code-backend-001", vec!["backend".into()], 1, "PEM");
        agent.status = AgentStatus::Idle;
        store.insert_agent(&agent).await.unwrap();

        assert!(orchestrator.run_cycle().await.unwrap());
    }
}
