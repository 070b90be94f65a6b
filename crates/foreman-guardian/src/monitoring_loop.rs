//! Monitoring Loop (§4.13): orchestrates the Guardian and Conductor
//! analyzers on independent, configurable cadences.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use foreman_bus::{EventBus, EventType, SystemEvent};
use foreman_store_core::{ControlPlaneStore, StorageError};
use foreman_types::EntityId;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::analysis::GuardianAnalysis;
use crate::{ConductorAnalyzer, ConductorAnalyzerError, ConductorReport, GuardianAnalyzer};

/// Default cadence for the Guardian sweep.
pub const DEFAULT_GUARDIAN_INTERVAL: Duration = Duration::from_secs(60);
/// Default cadence for the Conductor sweep.
pub const DEFAULT_CONDUCTOR_INTERVAL: Duration = Duration::from_secs(300);
/// Default cadence for the lightweight health check.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// Default bounded concurrency for Guardian analyses within one cycle.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Errors raised while running a monitoring cycle.
#[derive(Debug, Error)]
pub enum MonitoringLoopError {
    /// The backing store failed while listing agents.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The Conductor sweep failed.
    #[error(transparent)]
    Conductor(#[from] ConductorAnalyzerError),
}

/// Aggregate metrics for one completed cycle, published as
/// `monitoring.system.updated`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSummary {
    /// Number of agents the Guardian Analyzer considered this cycle.
    pub analyzed_agents: usize,
    /// Number of those analyses that recommended steering.
    pub steering_needed: usize,
    /// The Conductor's coherence snapshot for this cycle, if it ran.
    pub conductor: Option<ConductorReport>,
}

/// Orchestrates the Guardian and Conductor analyzers on their respective
/// cadences, exposing a one-shot cycle for tests and an emergency
/// synchronous path for operator-triggered analysis.
pub struct MonitoringLoop {
    guardian: Arc<GuardianAnalyzer>,
    conductor: Arc<ConductorAnalyzer>,
    store: Arc<dyn ControlPlaneStore>,
    bus: Arc<dyn EventBus>,
    guardian_interval: Duration,
    conductor_interval: Duration,
    health_check_interval: Duration,
    concurrency: usize,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MonitoringLoop {
    /// Construct a monitoring loop with the default cadences and
    /// concurrency.
    pub fn new(
        guardian: Arc<GuardianAnalyzer>,
        conductor: Arc<ConductorAnalyzer>,
        store: Arc<dyn ControlPlaneStore>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            guardian,
            conductor,
            store,
            bus,
            guardian_interval: DEFAULT_GUARDIAN_INTERVAL,
            conductor_interval: DEFAULT_CONDUCTOR_INTERVAL,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            concurrency: DEFAULT_CONCURRENCY,
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Override the three cadences.
    pub fn with_intervals(mut self, guardian: Duration, conductor: Duration, health_check: Duration) -> Self {
        self.guardian_interval = guardian;
        self.conductor_interval = conductor;
        self.health_check_interval = health_check;
        self
    }

    /// Override the bounded Guardian concurrency per cycle.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Run one Guardian sweep (bounded concurrency) followed by one
    /// Conductor sweep, and publish the aggregate `monitoring.system.updated`
    /// event. Used by `start`'s loop body and directly by tests.
    pub async fn run_single_cycle(&self) -> Result<CycleSummary, MonitoringLoopError> {
        let agents = self.store.list_agents().await?;
        let concurrency = self.concurrency;
        let guardian = self.guardian.clone();

        let analyses: Vec<GuardianAnalysis> = stream::iter(agents)
            .map(|agent| {
                let guardian = guardian.clone();
                async move { guardian.analyze_agent(agent.id).await }
            })
            .buffer_unordered(concurrency)
            .filter_map(|analysis| async move { analysis })
            .collect()
            .await;

        let steering_needed = analyses.iter().filter(|a| a.needs_steering).count();

        let conductor = match self.conductor.analyze().await {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(error = %err, "conductor sweep failed this cycle");
                None
            }
        };

        let summary = CycleSummary { analyzed_agents: analyses.len(), steering_needed, conductor };

        let _ = self.bus.publish(&SystemEvent::with_payload(
            EventType::Monitoring { suffix: "system.updated".into() },
            "monitoring",
            EntityId::new(),
            serde_json::to_value(&summary).unwrap_or(serde_json::Value::Null),
        ));

        Ok(summary)
    }

    /// Force-analyze a specific set of agents outside the normal cadence,
    /// returning the analyses that recommended steering.
    pub async fn trigger_emergency_analysis(&self, agent_ids: Vec<EntityId>) -> Vec<GuardianAnalysis> {
        let guardian = self.guardian.clone();
        stream::iter(agent_ids)
            .map(|agent_id| {
                let guardian = guardian.clone();
                async move { guardian.analyze_agent(agent_id).await }
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|analysis| async move { analysis })
            .filter(|analysis| {
                let needs = analysis.needs_steering;
                async move { needs }
            })
            .collect()
            .await
    }

    /// Start the loop in the background if it isn't already running.
    /// Idempotent: calling `start` on an already-running loop is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.bus.publish(&SystemEvent::with_payload(
            EventType::Monitoring { suffix: "loop.started".into() },
            "monitoring",
            EntityId::new(),
            serde_json::json!({}),
        ));

        let this = self.clone();
        let join = tokio::spawn(async move { this.drive().await });
        *self.handle.lock() = Some(join);
    }

    /// Stop the loop if it's running. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        let _ = self.bus.publish(&SystemEvent::with_payload(
            EventType::Monitoring { suffix: "loop.stopped".into() },
            "monitoring",
            EntityId::new(),
            serde_json::json!({}),
        ));
    }

    async fn drive(self: Arc<Self>) {
        let mut guardian_ticker = tokio::time::interval(self.guardian_interval);
        let mut conductor_ticker = tokio::time::interval(self.conductor_interval);
        let mut health_ticker = tokio::time::interval(self.health_check_interval);

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = guardian_ticker.tick() => {
                    if let Err(err) = self.run_single_cycle().await {
                        warn!(error = %err, "monitoring cycle failed");
                    }
                }
                _ = conductor_ticker.tick() => {
                    if let Err(err) = self.conductor.analyze().await {
                        warn!(error = %err, "standalone conductor tick failed");
                    }
                }
                _ = health_ticker.tick() => {
                    info!("monitoring loop health check tick");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_summary_round_trips_through_json() {
        let summary = CycleSummary { analyzed_agents: 3, steering_needed: 1, conductor: None };
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["analyzed_agents"], 3);
        assert_eq!(value["steering_needed"], 1);
    }
}
