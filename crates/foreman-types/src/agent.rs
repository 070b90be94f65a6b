//! Agent entity: a logical worker backed by a process or sandbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::HashMap;

use crate::{normalize_capabilities, EntityId};

/// State-machine status of an agent (§4.4).
///
/// ```text
/// SPAWNING → IDLE → RUNNING → IDLE
///                 ↘ DEGRADED ↗
/// SPAWNING, IDLE, RUNNING, DEGRADED → TERMINATED (terminal)
/// Any                              → QUARANTINED (terminal, only by force)
/// Any                              → FAILED (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentStatus {
    /// Registered but not yet live.
    Spawning,
    /// Live, no task assigned.
    Idle,
    /// Live, executing a task.
    Running,
    /// Live but unhealthy; still schedulable only with `include_degraded`.
    Degraded,
    /// Terminal: shut down cleanly.
    Terminated,
    /// Terminal: force-quarantined, never re-enters the pool.
    Quarantined,
    /// Terminal: failed irrecoverably.
    Failed,
}

impl AgentStatus {
    /// Terminal statuses admit no further transitions without `force=true`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentStatus::Terminated | AgentStatus::Quarantined | AgentStatus::Failed
        )
    }

    /// Whether the ordinary (non-`force`) transition table allows moving
    /// from `self` to `to`.
    pub fn allows_transition(self, to: AgentStatus) -> bool {
        use AgentStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, to),
            (Spawning, Idle)
                | (Idle, Running)
                | (Running, Idle)
                | (Running, Degraded)
                | (Degraded, Running)
                | (Spawning, Terminated)
                | (Idle, Terminated)
                | (Running, Terminated)
                | (Degraded, Terminated)
                | (Spawning, Failed)
                | (Idle, Failed)
                | (Running, Failed)
                | (Degraded, Failed)
        )
    }
}

/// Coarse health classification, distinct from [`AgentStatus`]: an agent can
/// be `Running` and `degraded` simultaneously while the status transition
/// catches up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentHealth {
    /// Heartbeats on time, no reported errors.
    Healthy,
    /// Heartbeats late or errors reported, not yet unrecoverable.
    Degraded,
    /// No longer reachable.
    Terminated,
}

/// A logical worker: may be backed by a long-lived process or an ephemeral
/// sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Opaque identifier, assigned at registration.
    pub id: EntityId,
    /// Backing implementation tag, e.g. `"claude-code"`, `"codex"`.
    pub agent_type: String,
    /// Implementation phase this agent serves, e.g. `"backend"`.
    pub phase: String,
    /// Human-readable name, `{type}-{phase-suffix}-{NNN}`.
    pub name: String,
    /// Normalized (trim + lowercase, empties dropped), deduplicated
    /// capability strings.
    pub capabilities: Vec<String>,
    /// Maximum number of concurrent tasks this agent can hold.
    pub capacity: u32,
    /// Current lifecycle status.
    pub status: AgentStatus,
    /// Free-form operator tags.
    pub tags: Vec<String>,
    /// Coarse health classification.
    pub health: AgentHealth,
    /// Last heartbeat timestamp.
    pub last_heartbeat: DateTime<Utc>,
    /// When this agent's health last became `Degraded`, if it is currently
    /// degraded. Cleared whenever health returns to `Healthy`; used to
    /// gate the restart-on-grace-period-expiry path.
    pub degraded_since: Option<DateTime<Utc>>,
    /// PEM-encoded public key; the matching private key is handed to the
    /// agent at spawn time and never persisted.
    pub crypto_public_key: String,
    /// Free-form metadata.
    pub metadata: HashMap<String, Json>,
    /// Registration timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-modified timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// Construct a new agent entry in `Spawning` status with normalized
    /// capabilities. `name` and `crypto_public_key` are supplied by the
    /// registry's identity step (§4.3.2), not derived here.
    pub fn new(
        agent_type: impl Into<String>,
        phase: impl Into<String>,
        name: impl Into<String>,
        capabilities: Vec<String>,
        capacity: u32,
        crypto_public_key: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new(),
            agent_type: agent_type.into(),
            phase: phase.into(),
            name: name.into(),
            capabilities: normalize_capabilities(capabilities),
            capacity,
            status: AgentStatus::Spawning,
            tags: Vec::new(),
            health: AgentHealth::Healthy,
            last_heartbeat: now,
            degraded_since: None,
            crypto_public_key: crypto_public_key.into(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace this agent's capability set, normalizing as it goes.
    pub fn set_capabilities(&mut self, capabilities: Vec<String>) {
        self.capabilities = normalize_capabilities(capabilities);
        self.updated_at = Utc::now();
    }

    /// Fraction of `required` capabilities this agent covers, in `[0, 1]`.
    /// Empty `required` is defined as full coverage (0 in the scoring
    /// formula is handled by the caller, per §4.3).
    pub fn capability_coverage(&self, required: &[String]) -> f64 {
        if required.is_empty() {
            return 0.0;
        }
        let have: std::collections::HashSet<&str> =
            self.capabilities.iter().map(String::as_str).collect();
        let matched = required.iter().filter(|r| have.contains(r.as_str())).count();
        matched as f64 / required.len() as f64
    }

    /// Search-ranking score from §4.3:
    /// `coverage + 0.2*is_IDLE + 0.2*is_healthy + 0.05*min(capacity,5)`.
    pub fn search_score(&self, required: &[String]) -> f64 {
        let coverage = self.capability_coverage(required);
        let idle_bonus = if self.status == AgentStatus::Idle { 0.2 } else { 0.0 };
        let healthy_bonus = if self.health == AgentHealth::Healthy { 0.2 } else { 0.0 };
        let capacity_bonus = 0.05 * (self.capacity.min(5) as f64);
        coverage + idle_bonus + healthy_bonus + capacity_bonus
    }

    /// Whether this agent is eligible for `search_agents` results:
    /// excluded when in a terminal status unless `include_degraded` widens
    /// the search (per §4.3, terminal statuses are always excluded —
    /// `include_degraded` only affects `AgentHealth::Degraded`, not terminal
    /// statuses).
    pub fn is_searchable(&self, include_degraded: bool) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        include_degraded || self.health != AgentHealth::Degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> Agent {
        Agent::new("claude-code", "backend", "claude-code-backend-001", vec!["Rust".into(), "rust".into()], 3, "PEM")
    }

    #[test]
    fn constructor_normalizes_and_dedupes_capabilities() {
        let a = agent();
        assert_eq!(a.capabilities, vec!["rust".to_string()]);
    }

    #[test]
    fn coverage_is_zero_for_empty_requirement() {
        let a = agent();
        assert_eq!(a.capability_coverage(&[]), 0.0);
    }

    #[test]
    fn coverage_and_score_match_formula() {
        let mut a = agent();
        a.status = AgentStatus::Idle;
        a.health = AgentHealth::Healthy;
        a.capacity = 10;
        let required = vec!["rust".to_string(), "go".to_string()];
        assert!((a.capability_coverage(&required) - 0.5).abs() < 1e-9);
        let expected = 0.5 + 0.2 + 0.2 + 0.05 * 5.0;
        assert!((a.search_score(&required) - expected).abs() < 1e-9);
    }

    #[test]
    fn terminal_statuses_excluded_from_search_regardless_of_degraded_flag() {
        let mut a = agent();
        a.status = AgentStatus::Terminated;
        assert!(!a.is_searchable(true));
        assert!(!a.is_searchable(false));
    }

    #[test]
    fn degraded_health_only_excluded_without_include_degraded() {
        let mut a = agent();
        a.status = AgentStatus::Idle;
        a.health = AgentHealth::Degraded;
        assert!(!a.is_searchable(false));
        assert!(a.is_searchable(true));
    }

    #[test]
    fn status_transition_table_matches_spec() {
        assert!(AgentStatus::Spawning.allows_transition(AgentStatus::Idle));
        assert!(AgentStatus::Idle.allows_transition(AgentStatus::Running));
        assert!(AgentStatus::Running.allows_transition(AgentStatus::Degraded));
        assert!(AgentStatus::Degraded.allows_transition(AgentStatus::Running));
        assert!(!AgentStatus::Idle.allows_transition(AgentStatus::Degraded));
        assert!(!AgentStatus::Terminated.allows_transition(AgentStatus::Idle));
    }
}
