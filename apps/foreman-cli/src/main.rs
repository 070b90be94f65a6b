#![forbid(unsafe_code)]

//! **foreman** – binary entry point wiring the control plane together:
//! persistence, event bus, task queue, orchestrator worker, idle sandbox
//! monitor, optional Guardian/Conductor monitoring loop, and the HTTP/WS
//! API surface, all driven from one process under a shared shutdown
//! signal.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use foreman_api::state::ApiState;
use foreman_bus::{EventBus, InMemoryBus};
use foreman_cost::alerting::AlertService;
use foreman_orchestrator::{ExecutionModeConfig, Orchestrator};
use foreman_orchestrator::idle_monitor::IdleSandboxMonitor;
use foreman_queue::TaskQueue;
use foreman_registry::AgentRegistry;
use foreman_sandbox::{MessageType, PreviewLink, SandboxError, SandboxGateway, SpawnRequest};
use foreman_store_core::ControlPlaneStore;
use foreman_store_memory::MemoryStore;
use foreman_store_sqlite::SqliteStore;
use foreman_trajectory::TrajectoryTracker;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// A [`SandboxGateway`] that refuses every call. Used when no concrete
/// sandbox backend is wired in and the deployment runs in legacy mode,
/// where [`Orchestrator`] never calls it but still needs a value to hold.
struct UnconfiguredSandboxGateway;

#[async_trait::async_trait]
impl SandboxGateway for UnconfiguredSandboxGateway {
    async fn spawn_for_task(&self, _request: SpawnRequest) -> Result<String, SandboxError> {
        Err(SandboxError::Backend("no sandbox gateway configured for this deployment".into()))
    }

    async fn terminate_sandbox(&self, _sandbox_id: &str) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn extract_session_transcript(&self, _sandbox_id: &str) -> Result<Option<String>, SandboxError> {
        Ok(None)
    }

    async fn get_preview_link(&self, _sandbox_id: &str, _port: u16) -> Result<PreviewLink, SandboxError> {
        Err(SandboxError::Backend("no sandbox gateway configured for this deployment".into()))
    }

    async fn send_message(&self, _sandbox_id: &str, _content: &str, _message_type: MessageType) -> Result<(), SandboxError> {
        Err(SandboxError::Backend("no sandbox gateway configured for this deployment".into()))
    }
}

#[derive(Parser)]
#[command(name = "foreman")]
#[command(about = "Foreman control plane worker and API surface")]
#[command(version)]
struct Cli {
    /// Storage backend: `memory` or `sqlite`.
    #[arg(long, default_value = "sqlite", env = "FOREMAN_STORAGE")]
    storage: String,

    /// Database path, used when `--storage sqlite`.
    #[arg(long, default_value = "data/foreman.db", env = "FOREMAN_DB_PATH")]
    db_path: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "FOREMAN_LOG_LEVEL")]
    log_level: String,

    /// HTTP server port for the API surface.
    #[arg(long, default_value = "8080", env = "FOREMAN_PORT")]
    port: u16,

    /// Implementation phase the orchestrator's legacy mode claims tasks
    /// for; unset claims any phase.
    #[arg(long, env = "FOREMAN_PHASE")]
    phase: Option<String>,

    /// Run the orchestrator in sandbox-execution mode instead of legacy
    /// mode. Requires a concrete `SandboxGateway` backend, which this
    /// binary does not ship; deployments that enable this must link one
    /// in separately.
    #[arg(long)]
    sandbox_mode: bool,

    /// Run the Guardian/Conductor monitoring loop alongside the
    /// orchestrator. Requires an LLM provider configured via environment
    /// (see `foreman_guardian::config::Config::from_env`).
    #[arg(long)]
    enable_guardian: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    info!("starting foreman control plane v{}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn ControlPlaneStore> = match cli.storage.as_str() {
        "memory" => Arc::new(MemoryStore::new()),
        "sqlite" => Arc::new(
            SqliteStore::open(&cli.db_path)
                .await
                .with_context(|| format!("failed to open sqlite store at {}", cli.db_path))?,
        ),
        other => anyhow::bail!("unsupported storage backend: {other}"),
    };
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new(1024));

    let queue = Arc::new(TaskQueue::new(store.clone(), bus.clone()));
    let registry = Arc::new(AgentRegistry::new(store.clone(), bus.clone()));
    let alerts = Arc::new(AlertService::new(bus.clone()));

    let sandbox: Arc<dyn SandboxGateway> = Arc::new(UnconfiguredSandboxGateway);
    let mode = if cli.sandbox_mode {
        ExecutionModeConfig::Sandbox { agent_type_for_phase: |phase, kind| format!("{phase}-{kind}") }
    } else {
        ExecutionModeConfig::Legacy { phase: cli.phase.clone() }
    };

    let orchestrator = Arc::new(Orchestrator::new(queue.clone(), registry.clone(), sandbox.clone(), bus.clone(), mode));
    let idle_monitor = Arc::new(IdleSandboxMonitor::new(sandbox.clone(), store.clone(), queue.clone(), bus.clone()));

    let monitoring_loop = if cli.enable_guardian {
        match foreman_guardian::config::Config::from_env() {
            Ok(llm_config) => {
                let gateway = Arc::new(foreman_guardian::LlmGateway::new(llm_config).await?);
                let trajectory = Arc::new(TrajectoryTracker::new());
                let guardian = Arc::new(foreman_guardian::GuardianAnalyzer::new(gateway.clone(), trajectory));
                let conductor = Arc::new(foreman_guardian::ConductorAnalyzer::new(gateway, guardian.clone(), store.clone()));
                let loop_ = Arc::new(foreman_guardian::MonitoringLoop::new(guardian, conductor, store.clone(), bus.clone()));
                info!("guardian/conductor monitoring loop enabled");
                Some(loop_)
            }
            Err(err) => {
                warn!("failed to configure guardian monitoring loop: {err}. Continuing without it.");
                None
            }
        }
    } else {
        None
    };

    let api_state = Arc::new(ApiState::new(store.clone(), queue.clone(), bus.clone(), Some(sandbox.clone()), alerts));
    api_state.spawn_event_log_tail();
    let app = foreman_api::build_router(api_state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", cli.port))
        .await
        .with_context(|| format!("failed to bind to port {}", cli.port))?;
    info!("HTTP server listening on port {}", cli.port);

    let orchestrator_handle = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run().await })
    };
    let idle_monitor_handle = {
        let idle_monitor = idle_monitor.clone();
        tokio::spawn(async move { idle_monitor.run().await })
    };
    let restart_sweep_handle = {
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                ticker.tick().await;
                match registry.check_restarts().await {
                    Ok(restarted) if !restarted.is_empty() => {
                        info!(count = restarted.len(), "restarted degraded agents past their grace period");
                    }
                    Ok(_) => {}
                    Err(err) => warn!("agent restart sweep failed: {err}"),
                }
            }
        })
    };
    let approval_timeout_handle = {
        let queue = queue.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                ticker.tick().await;
                match queue.check_approval_timeouts().await {
                    Ok(timed_out) if !timed_out.is_empty() => {
                        info!(count = timed_out.len(), "timed out tickets past their approval deadline");
                    }
                    Ok(_) => {}
                    Err(err) => warn!("ticket approval timeout sweep failed: {err}"),
                }
            }
        })
    };
    if let Some(loop_) = &monitoring_loop {
        loop_.start();
    }

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            if let Err(err) = result {
                error!("HTTP server error: {err}");
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("shutting down foreman control plane");
    orchestrator.request_shutdown();
    if let Some(loop_) = &monitoring_loop {
        loop_.stop();
    }
    orchestrator_handle.abort();
    idle_monitor_handle.abort();
    restart_sweep_handle.abort();
    approval_timeout_handle.abort();

    info!("foreman control plane stopped");
    Ok(())
}

fn init_logging(log_level: &str) {
    let filter = format!("foreman={level},foreman_orchestrator={level},foreman_guardian={level}", level = log_level);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
