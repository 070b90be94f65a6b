#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **foreman-trajectory** – Trajectory context assembly and caching for the
//! Foreman control plane (§4.10).
//!
//! [`TrajectoryTracker`] accumulates per-agent session state from the
//! `agent.event` stream (mirrors the teacher's DashMap-keyed progress
//! tracker) and assembles an LLM-prompt-ready [`TrajectoryContext`] on
//! demand, cached with a short TTL so the Guardian/Conductor analyzers
//! (§4.11, §4.12) don't re-derive it on every poll.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use foreman_bus::{EventType, SystemEvent};
use foreman_sandbox::{event_kind, SandboxEventKind};
use foreman_types::EntityId;
use serde::{Deserialize, Serialize};

/// Default cache lifetime for an assembled [`TrajectoryContext`].
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Assembled trajectory context for one agent session, suitable for
/// embedding directly into an analyzer prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryContext {
    /// Accumulated from input-type events: the first non-empty goal text
    /// seen this session.
    pub overall_goal: Option<String>,
    /// The latest output-type event's summary.
    pub current_focus: Option<String>,
    /// Seconds since the earliest event observed this session.
    pub session_duration_seconds: i64,
    /// Deduplicated constraint strings extracted from event detail maps.
    pub constraints: Vec<String>,
    /// Deduplicated blocker strings extracted from event detail maps.
    pub discovered_blockers: Vec<String>,
    /// Textual summary suitable for an LLM prompt.
    pub trajectory_summary: String,
}

#[derive(Debug, Clone)]
struct SessionState {
    phase: Option<String>,
    overall_goal: Option<String>,
    current_focus: Option<String>,
    constraints: Vec<String>,
    discovered_blockers: Vec<String>,
    session_started_at: DateTime<Utc>,
    event_count: u32,
}

impl SessionState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            phase: None,
            overall_goal: None,
            current_focus: None,
            constraints: Vec::new(),
            discovered_blockers: Vec::new(),
            session_started_at: now,
            event_count: 0,
        }
    }
}

struct CachedContext {
    built_at: Instant,
    context: TrajectoryContext,
}

/// Accumulates per-agent session state and assembles/caches
/// [`TrajectoryContext`] snapshots.
pub struct TrajectoryTracker {
    sessions: DashMap<EntityId, SessionState>,
    cache: DashMap<EntityId, CachedContext>,
    ttl: Duration,
}

impl TrajectoryTracker {
    /// Construct a tracker using [`DEFAULT_CACHE_TTL`].
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_CACHE_TTL)
    }

    /// Construct a tracker with a caller-supplied cache TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { sessions: DashMap::new(), cache: DashMap::new(), ttl }
    }

    /// Feed one `agent.event` into the session accumulator for `agent_id`.
    /// Events with no recognized `kind` discriminator are ignored.
    /// Invalidates any cached context for this agent.
    pub fn record_event(&self, agent_id: EntityId, event: &SystemEvent) {
        if event.event_type != EventType::AgentEvent {
            return;
        }
        let Some(kind) = event_kind(event) else {
            return;
        };
        let now = Utc::now();

        {
            let mut session =
                self.sessions.entry(agent_id).or_insert_with(|| SessionState::new(now));
            session.event_count += 1;

            if session.phase.is_none() {
                if let Some(phase) = event.payload.get("phase").and_then(|v| v.as_str()) {
                    if !phase.is_empty() {
                        session.phase = Some(phase.to_string());
                    }
                }
            }

            if is_input_event(kind) && session.overall_goal.is_none() {
                if let Some(goal) = event.payload.get("goal").and_then(|v| v.as_str()) {
                    if !goal.is_empty() {
                        session.overall_goal = Some(goal.to_string());
                    }
                }
            }

            if is_output_event(kind) {
                session.current_focus = Some(
                    event
                        .payload
                        .get("summary")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| kind.wire_tag().to_string()),
                );
            }

            if let Some(constraint) = event.payload.get("constraint").and_then(|v| v.as_str()) {
                if !session.constraints.iter().any(|c| c == constraint) {
                    session.constraints.push(constraint.to_string());
                }
            }
            if let Some(blocker) = event.payload.get("blocker").and_then(|v| v.as_str()) {
                if !session.discovered_blockers.iter().any(|b| b == blocker) {
                    session.discovered_blockers.push(blocker.to_string());
                }
            }
        }

        self.cache.remove(&agent_id);
    }

    /// Assemble (or return a cached) trajectory context for `agent_id`.
    /// Returns `None` if the agent has no recorded events — the analyzers
    /// that consume this treat that as "nothing to analyze yet".
    pub fn context_for(&self, agent_id: EntityId) -> Option<TrajectoryContext> {
        if let Some(cached) = self.cache.get(&agent_id) {
            if cached.built_at.elapsed() < self.ttl {
                return Some(cached.context.clone());
            }
        }

        let context = {
            let session = self.sessions.get(&agent_id)?;
            build_context(&session, Utc::now())
        };
        self.cache.insert(agent_id, CachedContext { built_at: Instant::now(), context: context.clone() });
        Some(context)
    }

    /// Invalidate the cached snapshot for one agent, or for every agent if
    /// `agent_id` is `None`. Session state itself (the accumulated goal,
    /// focus, etc.) is untouched; only the cached assembly is dropped.
    pub fn clear_cache(&self, agent_id: Option<EntityId>) {
        match agent_id {
            Some(id) => {
                self.cache.remove(&id);
            }
            None => self.cache.clear(),
        }
    }
}

impl Default for TrajectoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn is_input_event(kind: SandboxEventKind) -> bool {
    matches!(
        kind,
        SandboxEventKind::Started | SandboxEventKind::ToolUse | SandboxEventKind::AssistantMessage
    )
}

fn is_output_event(kind: SandboxEventKind) -> bool {
    kind.is_work_event()
}

fn build_context(session: &SessionState, now: DateTime<Utc>) -> TrajectoryContext {
    let session_duration_seconds = (now - session.session_started_at).num_seconds().max(0);
    let trajectory_summary = format!(
        "goal={} focus={} phase={} duration={}s events={} blockers={}",
        session.overall_goal.as_deref().unwrap_or("unknown"),
        session.current_focus.as_deref().unwrap_or("unknown"),
        session.phase.as_deref().unwrap_or("unknown"),
        session_duration_seconds,
        session.event_count,
        session.discovered_blockers.len(),
    );
    TrajectoryContext {
        overall_goal: session.overall_goal.clone(),
        current_focus: session.current_focus.clone(),
        session_duration_seconds,
        constraints: session.constraints.clone(),
        discovered_blockers: session.discovered_blockers.clone(),
        trajectory_summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_sandbox::sandbox_event;

    #[test]
    fn agent_with_no_events_has_no_context() {
        let tracker = TrajectoryTracker::new();
        assert!(tracker.context_for(EntityId::new()).is_none());
    }

    #[test]
    fn records_first_goal_and_latest_focus() {
        let tracker = TrajectoryTracker::new();
        let agent = EntityId::new();

        tracker.record_event(
            agent,
            &sandbox_event(
                SandboxEventKind::Started,
                agent,
                "sandbox-1",
                serde_json::json!({ "goal": "implement the login endpoint", "phase": "backend" }),
            ),
        );
        tracker.record_event(
            agent,
            &sandbox_event(
                SandboxEventKind::ToolCompleted,
                agent,
                "sandbox-1",
                serde_json::json!({ "summary": "ran cargo test" }),
            ),
        );

        let context = tracker.context_for(agent).unwrap();
        assert_eq!(context.overall_goal.as_deref(), Some("implement the login endpoint"));
        assert_eq!(context.current_focus.as_deref(), Some("ran cargo test"));
        assert!(context.trajectory_summary.contains("backend"));
    }

    #[test]
    fn goal_does_not_get_overwritten_by_a_later_input_event() {
        let tracker = TrajectoryTracker::new();
        let agent = EntityId::new();

        tracker.record_event(
            agent,
            &sandbox_event(
                SandboxEventKind::Started,
                agent,
                "sandbox-1",
                serde_json::json!({ "goal": "first goal" }),
            ),
        );
        tracker.record_event(
            agent,
            &sandbox_event(
                SandboxEventKind::ToolUse,
                agent,
                "sandbox-1",
                serde_json::json!({ "goal": "second goal" }),
            ),
        );

        let context = tracker.context_for(agent).unwrap();
        assert_eq!(context.overall_goal.as_deref(), Some("first goal"));
    }

    #[test]
    fn blockers_and_constraints_are_deduplicated() {
        let tracker = TrajectoryTracker::new();
        let agent = EntityId::new();

        for _ in 0..3 {
            tracker.record_event(
                agent,
                &sandbox_event(
                    SandboxEventKind::Error,
                    agent,
                    "sandbox-1",
                    serde_json::json!({ "blocker": "missing API key" }),
                ),
            );
        }

        let context = tracker.context_for(agent).unwrap();
        assert_eq!(context.discovered_blockers, vec!["missing API key".to_string()]);
    }

    #[test]
    fn clear_cache_does_not_lose_accumulated_session_state() {
        let tracker = TrajectoryTracker::new();
        let agent = EntityId::new();
        tracker.record_event(
            agent,
            &sandbox_event(
                SandboxEventKind::Started,
                agent,
                "sandbox-1",
                serde_json::json!({ "goal": "ship the feature" }),
            ),
        );

        let before = tracker.context_for(agent).unwrap();
        tracker.clear_cache(Some(agent));
        let after = tracker.context_for(agent).unwrap();
        assert_eq!(before.overall_goal, after.overall_goal);
    }
}
