//! Guardian Analyzer (§4.11): per-agent "are you on-track?" analysis.
//!
//! Periodically asks the LLM whether an agent's session is still aligned
//! with its trajectory context (§4.10), persists the result, and hands off
//! to [`crate::InterventionService`] when the agent needs steering.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use foreman_types::EntityId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use foreman_trajectory::TrajectoryTracker;

use crate::{LlmGateway, LlmRequest};

/// Errors raised while analyzing an agent's trajectory.
#[derive(Debug, Error)]
pub enum GuardianAnalyzerError {
    /// The LLM gateway rejected or failed to complete the request.
    #[error("llm completion failed: {0}")]
    Llm(#[from] anyhow::Error),
    /// The LLM's response wasn't the expected JSON shape.
    #[error("malformed analysis response: {0}")]
    MalformedResponse(#[from] serde_json::Error),
}

/// A persisted Guardian Analysis for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardianAnalysis {
    /// The agent this analysis concerns.
    pub agent_id: EntityId,
    /// Whether the LLM judged the session aligned with its trajectory.
    pub trajectory_aligned: bool,
    /// Alignment confidence in `[0, 1]`.
    pub alignment_score: f64,
    /// Whether this analysis recommends steering.
    pub needs_steering: bool,
    /// Recommended steering category, if `needs_steering`.
    pub steering_type: Option<String>,
    /// Free-text steering recommendation, if `needs_steering`.
    pub steering_recommendation: Option<String>,
    /// LLM-authored summary of the session trajectory.
    pub trajectory_summary: String,
    /// LLM-authored restatement of the agent's current focus.
    pub current_focus: String,
    /// Number of events folded into this analysis.
    pub conversation_length: i32,
    /// Human-readable session duration, as reported by the LLM.
    pub session_duration: String,
    /// Whether this analysis is a degraded fallback (LLM call failed).
    pub degraded: bool,
    /// When this analysis was produced.
    pub analyzed_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct AnalysisResult {
    trajectory_aligned: bool,
    alignment_score: f64,
    needs_steering: bool,
    #[serde(default)]
    steering_type: Option<String>,
    #[serde(default)]
    steering_recommendation: Option<String>,
    trajectory_summary: String,
    current_focus: String,
    conversation_length: i32,
    session_duration: String,
}

/// Periodically evaluates whether an agent's session is on-track, and
/// persists the latest [`GuardianAnalysis`] per agent so the Conductor
/// Analyzer (§4.12) can fold it into system-wide coherence.
pub struct GuardianAnalyzer {
    gateway: Arc<LlmGateway>,
    trajectory: Arc<TrajectoryTracker>,
    latest: DashMap<EntityId, GuardianAnalysis>,
}

impl GuardianAnalyzer {
    /// Construct an analyzer over a shared LLM gateway and trajectory tracker.
    pub fn new(gateway: Arc<LlmGateway>, trajectory: Arc<TrajectoryTracker>) -> Self {
        Self { gateway, trajectory, latest: DashMap::new() }
    }

    /// Analyze one agent's current trajectory. Returns `None` if the agent
    /// has no recorded events yet (nothing to analyze).
    pub async fn analyze_agent(&self, agent_id: EntityId) -> Option<GuardianAnalysis> {
        let context = self.trajectory.context_for(agent_id)?;

        let prompt = format!(
            "You are monitoring an autonomous coding agent. Given its trajectory \
             context below, answer whether it is still on-track and whether it \
             needs steering. Respond with JSON only: {{\"trajectory_aligned\": bool, \
             \"alignment_score\": float in [0,1], \"needs_steering\": bool, \
             \"steering_type\": string or null, \"steering_recommendation\": string or null, \
             \"trajectory_summary\": string, \"current_focus\": string, \
             \"conversation_length\": int, \"session_duration\": string}}.\n\n\
             Overall goal: {}\nCurrent focus: {}\nSession duration (s): {}\n\
             Constraints: {:?}\nDiscovered blockers: {:?}\nSummary so far: {}",
            context.overall_goal.as_deref().unwrap_or("unknown"),
            context.current_focus.as_deref().unwrap_or("unknown"),
            context.session_duration_seconds,
            context.constraints,
            context.discovered_blockers,
            context.trajectory_summary,
        );

        let analysis = match self.run_analysis(agent_id, &prompt).await {
            Ok(analysis) => analysis,
            Err(err) => {
                warn!(%agent_id, error = %err, "guardian analysis failed, recording degraded result");
                degraded_analysis(agent_id, &context)
            }
        };

        self.latest.insert(agent_id, analysis.clone());
        Some(analysis)
    }

    async fn run_analysis(
        &self,
        agent_id: EntityId,
        prompt: &str,
    ) -> Result<GuardianAnalysis, GuardianAnalyzerError> {
        let mut request = LlmRequest::new(prompt).map_err(GuardianAnalyzerError::Llm)?;
        request = request.with_max_tokens(512);
        let response = self.gateway.complete(request).await?;

        let parsed: AnalysisResult = serde_json::from_str(response.content())?;
        Ok(GuardianAnalysis {
            agent_id,
            trajectory_aligned: parsed.trajectory_aligned,
            alignment_score: parsed.alignment_score.clamp(0.0, 1.0),
            needs_steering: parsed.needs_steering,
            steering_type: parsed.steering_type,
            steering_recommendation: parsed.steering_recommendation,
            trajectory_summary: parsed.trajectory_summary,
            current_focus: parsed.current_focus,
            conversation_length: parsed.conversation_length,
            session_duration: parsed.session_duration,
            degraded: false,
            analyzed_at: Utc::now(),
        })
    }

    /// The most recent analysis for `agent_id`, if one has been run.
    pub fn latest_for(&self, agent_id: EntityId) -> Option<GuardianAnalysis> {
        self.latest.get(&agent_id).map(|entry| entry.clone())
    }

    /// All analyses run within `within` of `now`, for the Conductor
    /// Analyzer's system-wide sweep (§4.12).
    pub fn recent_analyses(&self, now: DateTime<Utc>, within: chrono::Duration) -> Vec<GuardianAnalysis> {
        self.latest
            .iter()
            .filter(|entry| now - entry.analyzed_at <= within)
            .map(|entry| entry.value().clone())
            .collect()
    }
}

/// Build a degraded analysis for when the LLM call itself fails: the loop
/// must never block on a provider outage.
fn degraded_analysis(agent_id: EntityId, context: &foreman_trajectory::TrajectoryContext) -> GuardianAnalysis {
    GuardianAnalysis {
        agent_id,
        trajectory_aligned: false,
        alignment_score: 0.0,
        needs_steering: false,
        steering_type: None,
        steering_recommendation: None,
        trajectory_summary: context.trajectory_summary.clone(),
        current_focus: context.current_focus.clone().unwrap_or_default(),
        conversation_length: 0,
        session_duration: format!("{}s", context.session_duration_seconds),
        degraded: true,
        analyzed_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_sandbox::{sandbox_event, SandboxEventKind};

    fn trajectory_with_event(agent: EntityId) -> Arc<TrajectoryTracker> {
        let tracker = Arc::new(TrajectoryTracker::new());
        tracker.record_event(
            agent,
            &sandbox_event(
                SandboxEventKind::Started,
                agent,
                "sandbox-1",
                serde_json::json!({ "goal": "ship the login page" }),
            ),
        );
        tracker
    }

    #[test]
    fn degraded_analysis_is_zero_score_and_marked_degraded() {
        let agent = EntityId::new();
        let tracker = trajectory_with_event(agent);
        let context = tracker.context_for(agent).unwrap();

        let degraded = degraded_analysis(agent, &context);
        assert_eq!(degraded.alignment_score, 0.0);
        assert!(!degraded.needs_steering);
        assert!(degraded.degraded);
    }

    #[test]
    fn recent_analyses_filters_by_window() {
        let analyzer_latest: DashMap<EntityId, GuardianAnalysis> = DashMap::new();
        let agent = EntityId::new();
        let mut analysis = degraded_analysis(agent, &TrajectoryTracker::new().context_for(agent).unwrap_or_default());
        analysis.analyzed_at = Utc::now() - chrono::Duration::minutes(20);
        analyzer_latest.insert(agent, analysis);

        let recent: Vec<_> = analyzer_latest
            .iter()
            .filter(|entry| Utc::now() - entry.analyzed_at <= chrono::Duration::minutes(10))
            .map(|entry| entry.value().clone())
            .collect();
        assert!(recent.is_empty());
    }
}
