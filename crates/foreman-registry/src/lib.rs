#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **foreman-registry** – Agent registry and status manager for the
//! Foreman control plane.
//!
//! [`AgentRegistry`] runs the multi-step `register_agent` protocol
//! (validation, identity assignment, entry, bus subscription bookkeeping,
//! heartbeat seeding) and the search/update operations built on top of it.
//! [`StatusManager`] enforces the agent lifecycle state machine, rejecting
//! transitions the ordinary table forbids unless `force=true`.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value as Json;

use foreman_bus::{EventBus, EventType, SystemEvent};
use foreman_store_core::{ControlPlaneStore, StorageError};
use foreman_types::{Agent, AgentHealth, AgentStatus, EntityId};

/// How long an agent may sit `Degraded` before `check_restarts` considers
/// it eligible for a restart.
pub const DEFAULT_RESTART_GRACE_PERIOD: chrono::Duration = chrono::Duration::minutes(5);

/// Errors raised by registry and status-manager operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// `register_agent` failed an invariant at one of its protocol steps.
    #[error("registration rejected: {reason}")]
    RegistrationRejected {
        /// Short machine-readable reason.
        reason: String,
        /// Structured detail for the caller.
        details: Json,
    },
    /// A status transition was not in the ordinary table and `force` was
    /// not set.
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// The agent's current status.
        from: AgentStatus,
        /// The requested status.
        to: AgentStatus,
    },
    /// The referenced agent does not exist.
    #[error("agent not found: {0}")]
    NotFound(EntityId),
    /// The backing store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Input to [`AgentRegistry::register_agent`].
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    /// Backing implementation tag, e.g. `"claude-code"`.
    pub agent_type: String,
    /// Implementation phase this agent serves, e.g. `"backend"`.
    pub phase: String,
    /// Requested capabilities (normalized by [`foreman_types::Agent::new`]).
    pub capabilities: Vec<String>,
    /// Maximum concurrent task capacity.
    pub capacity: u32,
    /// Semantic version of the agent implementation being registered.
    pub version: String,
    /// Free-form config; must be a JSON object if present.
    pub config: Option<Json>,
    /// Free-form resource requirements; must be a JSON object if present.
    pub resource_requirements: Option<Json>,
    /// Expected binary checksum, checked against `observed_checksum` when
    /// both are supplied.
    pub expected_checksum: Option<String>,
    /// Checksum observed for the binary at the supplied path, computed by
    /// the caller (this crate does no filesystem I/O).
    pub observed_checksum: Option<String>,
    /// Status the agent should be lifted to once registration completes.
    /// Defaults to `Idle` if `None`.
    pub requested_status: Option<AgentStatus>,
}

/// A freshly generated agent identity: the persisted [`Agent`] plus the
/// PEM-encoded private key, which is returned to the caller and never
/// stored.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    /// The registered agent record.
    pub agent: Agent,
    /// PEM-encoded RSA private key. Hand this to the agent process; it is
    /// not retained anywhere in the control plane.
    pub private_key_pem: String,
}

fn is_object_or_absent(value: &Option<Json>) -> bool {
    matches!(value, None | Some(Json::Object(_)))
}

fn generate_keypair() -> Result<(String, String), RegistryError> {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};

    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 2048).map_err(|e| {
        RegistryError::RegistrationRejected {
            reason: "key_generation_failed".into(),
            details: Json::String(e.to_string()),
        }
    })?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| RegistryError::RegistrationRejected {
            reason: "key_encoding_failed".into(),
            details: Json::String(e.to_string()),
        })?
        .to_string();
    let public_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| RegistryError::RegistrationRejected {
            reason: "key_encoding_failed".into(),
            details: Json::String(e.to_string()),
        })?;

    Ok((public_pem, private_pem))
}

/// Agent registry: `register_agent`, `update_agent`, `toggle_availability`,
/// `search_agents` (§4.3).
pub struct AgentRegistry {
    store: Arc<dyn ControlPlaneStore>,
    bus: Arc<dyn EventBus>,
}

impl AgentRegistry {
    /// Construct a registry backed by `store` and `bus`.
    pub fn new(store: Arc<dyn ControlPlaneStore>, bus: Arc<dyn EventBus>) -> Self {
        Self { store, bus }
    }

    /// Run the full registration protocol. Returns the persisted agent and
    /// its one-time private key, or `RegistrationRejected` if any step's
    /// invariant is violated.
    pub async fn register_agent(
        &self,
        request: RegistrationRequest,
    ) -> Result<AgentIdentity, RegistryError> {
        // 1. Validation.
        if !is_object_or_absent(&request.config) {
            return Err(RegistryError::RegistrationRejected {
                reason: "config_must_be_a_map".into(),
                details: request.config.clone().unwrap_or(Json::Null),
            });
        }
        if !is_object_or_absent(&request.resource_requirements) {
            return Err(RegistryError::RegistrationRejected {
                reason: "resource_requirements_must_be_a_map".into(),
                details: request.resource_requirements.clone().unwrap_or(Json::Null),
            });
        }
        if let (Some(expected), Some(observed)) =
            (&request.expected_checksum, &request.observed_checksum)
        {
            if expected != observed {
                return Err(RegistryError::RegistrationRejected {
                    reason: "checksum_mismatch".into(),
                    details: serde_json::json!({ "expected": expected, "observed": observed }),
                });
            }
        }
        if request.version.trim().is_empty() {
            return Err(RegistryError::RegistrationRejected {
                reason: "version_required".into(),
                details: Json::Null,
            });
        }

        // 2. Identity.
        let sequence = self.next_sequence(&request.agent_type, &request.phase).await?;
        let phase_suffix = request.phase.chars().take(4).collect::<String>();
        let name = format!("{}-{}-{:03}", request.agent_type, phase_suffix, sequence);
        let (public_key_pem, private_key_pem) = generate_keypair()?;

        let mut agent = Agent::new(
            request.agent_type.clone(),
            request.phase.clone(),
            name,
            request.capabilities,
            request.capacity,
            public_key_pem,
        );
        agent
            .metadata
            .insert("version".into(), Json::String(request.version));
        if let Some(cfg) = request.config {
            agent.metadata.insert("config".into(), cfg);
        }
        if let Some(req) = request.resource_requirements {
            agent.metadata.insert("resource_requirements".into(), req);
        }

        // 3. Entry (status=Spawning is the default from `Agent::new`).
        // 4. Bus subscriptions: record the topics this agent is bound to.
        let subscriptions = vec![
            format!("task.assignment.{}", request.phase),
            "system.broadcast".into(),
            "system.shutdown".into(),
        ];
        agent.metadata.insert(
            "subscribed_topics".into(),
            Json::Array(subscriptions.into_iter().map(Json::String).collect()),
        );

        // 5. Heartbeat seeding already set by `Agent::new` (`last_heartbeat = now`).
        self.store.insert_agent(&agent).await?;
        let _ = self.bus.publish(&SystemEvent::new(
            EventType::AgentRegistered,
            "agent",
            agent.id,
        ));

        // The status manager then lifts the agent out of `Spawning`.
        let target = request.requested_status.unwrap_or(AgentStatus::Idle);
        let manager = StatusManager::new(self.store.clone(), self.bus.clone());
        let agent = manager
            .apply_transition(agent.id, target, "registry", "initial activation", false)
            .await?;

        Ok(AgentIdentity { agent, private_key_pem })
    }

    async fn next_sequence(&self, agent_type: &str, phase: &str) -> Result<u32, RegistryError> {
        let existing = self.store.list_agents().await?;
        let count = existing
            .iter()
            .filter(|a| a.agent_type == agent_type && a.phase == phase)
            .count();
        Ok(count as u32 + 1)
    }

    /// Overwrite an agent's mutable fields. Emits `agent.capability.updated`
    /// when `capabilities` differ from the stored value.
    pub async fn update_agent(
        &self,
        id: EntityId,
        capabilities: Option<Vec<String>>,
        capacity: Option<u32>,
        tags: Option<Vec<String>>,
    ) -> Result<Agent, RegistryError> {
        let mut agent = self
            .store
            .get_agent(id)
            .await?
            .ok_or(RegistryError::NotFound(id))?;

        let capabilities_changed = if let Some(caps) = capabilities {
            agent.set_capabilities(caps);
            true
        } else {
            false
        };
        if let Some(capacity) = capacity {
            agent.capacity = capacity;
        }
        if let Some(tags) = tags {
            agent.tags = tags;
        }
        agent.updated_at = Utc::now();
        self.store.update_agent(&agent).await?;

        if capabilities_changed {
            let _ = self.bus.publish(&SystemEvent::new(
                EventType::AgentCapabilityUpdated,
                "agent",
                agent.id,
            ));
        }
        Ok(agent)
    }

    /// Toggle whether an agent is available for scheduling: `true` moves
    /// it to `Idle`, `false` moves it to `Degraded`. Only valid from a
    /// non-terminal status.
    pub async fn toggle_availability(
        &self,
        id: EntityId,
        available: bool,
        initiated_by: &str,
    ) -> Result<Agent, RegistryError> {
        let target = if available { AgentStatus::Idle } else { AgentStatus::Degraded };
        let manager = StatusManager::new(self.store.clone(), self.bus.clone());
        manager
            .apply_transition(id, target, initiated_by, "toggle_availability", false)
            .await
    }

    /// Restart an agent's identity: re-seed its heartbeat, clear
    /// `degraded_since`, preserve its capabilities, and force it back to
    /// `Idle` regardless of its current status. Used both for an explicit
    /// operator request and by [`Self::check_restarts`] once a `Degraded`
    /// agent has sat past its grace period.
    pub async fn restart_agent(
        &self,
        id: EntityId,
        initiated_by: &str,
        reason: &str,
    ) -> Result<Agent, RegistryError> {
        let manager = StatusManager::new(self.store.clone(), self.bus.clone());
        let mut agent = manager.apply_transition(id, AgentStatus::Idle, initiated_by, reason, true).await?;

        agent.health = AgentHealth::Healthy;
        agent.degraded_since = None;
        agent.last_heartbeat = Utc::now();
        agent.updated_at = Utc::now();
        self.store.update_agent(&agent).await?;

        let _ = self.bus.publish(&SystemEvent::with_payload(
            EventType::AgentRestarted,
            "agent",
            agent.id,
            serde_json::json!({ "initiated_by": initiated_by, "reason": reason }),
        ));
        tracing::info!(agent_id = %agent.id, reason, "agent restarted");

        Ok(agent)
    }

    /// Agents currently `Degraded` past [`DEFAULT_RESTART_GRACE_PERIOD`],
    /// as of `now`.
    pub async fn agents_due_for_restart(&self, now: chrono::DateTime<Utc>) -> Result<Vec<Agent>, RegistryError> {
        let agents = self.store.list_agents().await?;
        Ok(agents
            .into_iter()
            .filter(|a| a.status == AgentStatus::Degraded)
            .filter(|a| match a.degraded_since {
                Some(since) => now - since >= DEFAULT_RESTART_GRACE_PERIOD,
                None => false,
            })
            .collect())
    }

    /// Sweep once: restart every agent [`Self::agents_due_for_restart`]
    /// returns, as the restart orchestrator's grace-period path. Operator-
    /// requested restarts go straight through [`Self::restart_agent`]
    /// instead.
    pub async fn check_restarts(&self) -> Result<Vec<Agent>, RegistryError> {
        let due = self.agents_due_for_restart(Utc::now()).await?;
        let mut restarted = Vec::with_capacity(due.len());
        for agent in due {
            restarted.push(self.restart_agent(agent.id, "restart_orchestrator", "degraded_grace_period_exceeded").await?);
        }
        Ok(restarted)
    }

    /// Rank up to `limit` agents by the §4.3 search score, tie-broken by
    /// `created_at` ascending. Excludes terminal-status agents always;
    /// excludes `Degraded`-health agents unless `include_degraded`.
    pub async fn search_agents(
        &self,
        required_capabilities: &[String],
        phase: Option<&str>,
        agent_type: Option<&str>,
        limit: usize,
        include_degraded: bool,
    ) -> Result<Vec<Agent>, RegistryError> {
        let mut candidates: Vec<Agent> = self
            .store
            .list_agents()
            .await?
            .into_iter()
            .filter(|a| a.is_searchable(include_degraded))
            .filter(|a| phase.map(|p| a.phase == p).unwrap_or(true))
            .filter(|a| agent_type.map(|t| a.agent_type == t).unwrap_or(true))
            .collect();

        candidates.sort_by(|a, b| {
            let score_a = a.search_score(required_capabilities);
            let score_b = b.search_score(required_capabilities);
            score_b
                .partial_cmp(&score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.created_at.cmp(&b.created_at))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }
}

/// Enforces the §4.4 agent lifecycle state machine.
pub struct StatusManager {
    store: Arc<dyn ControlPlaneStore>,
    bus: Arc<dyn EventBus>,
}

impl StatusManager {
    /// Construct a status manager backed by `store` and `bus`.
    pub fn new(store: Arc<dyn ControlPlaneStore>, bus: Arc<dyn EventBus>) -> Self {
        Self { store, bus }
    }

    /// Apply a status transition. Rejected with `InvalidTransition` unless
    /// the ordinary table allows it or `force=true`. Every applied
    /// transition is recorded (`initiated_by`, `reason`) and emitted on the
    /// bus as `agent.event`.
    pub async fn apply_transition(
        &self,
        id: EntityId,
        to: AgentStatus,
        initiated_by: &str,
        reason: &str,
        force: bool,
    ) -> Result<Agent, RegistryError> {
        let mut agent = self
            .store
            .get_agent(id)
            .await?
            .ok_or(RegistryError::NotFound(id))?;

        let from = agent.status;
        if !force && !from.allows_transition(to) {
            return Err(RegistryError::InvalidTransition { from, to });
        }

        if to == AgentStatus::Degraded && from != AgentStatus::Degraded {
            agent.degraded_since = Some(Utc::now());
        } else if from == AgentStatus::Degraded && to != AgentStatus::Degraded {
            agent.degraded_since = None;
        }
        agent.status = to;
        agent.updated_at = Utc::now();
        self.store.update_agent(&agent).await?;

        let _ = self.bus.publish(&SystemEvent::with_payload(
            EventType::AgentEvent,
            "agent",
            agent.id,
            serde_json::json!({
                "kind": "status_changed",
                "from": from,
                "to": to,
                "initiated_by": initiated_by,
                "reason": reason,
                "forced": force,
            }),
        ));

        tracing::info!(
            agent_id = %agent.id,
            from = ?from,
            to = ?to,
            forced = force,
            "agent status transition applied"
        );

        Ok(agent)
    }
}
