#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **foreman-sandbox** – Sandbox gateway contract for the Foreman control
//! plane (§4.7).
//!
//! Defines [`SandboxGateway`], the abstract "spawn / terminate / extract
//! transcript / send message" contract consumed by the Orchestrator and
//! Validator. The concrete runtime backing a sandbox (a container, a VM, a
//! remote agent harness) is out of scope here — this crate only owns the
//! contract and the vocabulary sandboxes use to report progress back onto
//! the bus.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_bus::{EventType, SystemEvent};
use foreman_types::EntityId;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Which execution runtime a sandbox should be spawned under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// The default hosted container runtime.
    Container,
    /// A locally-run process, for development and testing.
    Local,
}

/// Parameters for [`SandboxGateway::spawn_for_task`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    /// The task this sandbox executes.
    pub task_id: EntityId,
    /// The agent bound to the sandbox.
    pub agent_id: EntityId,
    /// Implementation phase tag.
    pub phase_id: String,
    /// Agent template tag selecting which harness to boot.
    pub agent_type: String,
    /// Additional environment variables injected into the sandbox.
    pub extra_env: Option<std::collections::HashMap<String, String>>,
    /// Runtime override, if the deployment supports more than one.
    pub runtime: Option<String>,
    /// Execution mode override.
    pub execution_mode: Option<ExecutionMode>,
}

/// A reachable preview endpoint exposed by a running sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewLink {
    /// The URL at which the sandboxed service is reachable.
    pub url: String,
    /// An access token required to reach it, if the deployment requires one.
    pub token: Option<String>,
}

/// A message sent into a running sandbox via [`SandboxGateway::send_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// A steering nudge from the Guardian/Conductor analyzers.
    Steering,
    /// A user-authored chat message forwarded into the session.
    UserMessage,
    /// An operator command (pause, resume, …).
    Control,
}

/// Errors raised by a [`SandboxGateway`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The remote runtime refused or failed the spawn request.
    #[error("failed to spawn sandbox: {0}")]
    SpawnFailed(String),
    /// The sandbox id does not correspond to a live sandbox.
    #[error("sandbox not found: {0}")]
    NotFound(String),
    /// The remote runtime was unreachable or returned an error.
    #[error("sandbox backend error: {0}")]
    Backend(String),
}

/// Abstract contract over a remote sandbox runtime (§4.7). Implemented
/// outside this crate by whatever concrete runtime a deployment uses;
/// kept here as a trait so the Orchestrator and Validator can depend on
/// the contract without depending on a specific backend.
#[async_trait]
pub trait SandboxGateway: Send + Sync {
    /// Spawn a sandbox for `request`, returning its `sandbox_id`.
    async fn spawn_for_task(&self, request: SpawnRequest) -> Result<String, SandboxError>;

    /// Terminate a running sandbox. Idempotent: terminating an
    /// already-terminated sandbox is not an error.
    async fn terminate_sandbox(&self, sandbox_id: &str) -> Result<(), SandboxError>;

    /// Extract the session transcript as a base64-encoded string, or
    /// `None` if the sandbox has no transcript (not yet started, or
    /// already reaped).
    async fn extract_session_transcript(
        &self,
        sandbox_id: &str,
    ) -> Result<Option<String>, SandboxError>;

    /// Resolve a reachable preview link for `port` on the sandbox.
    async fn get_preview_link(
        &self,
        sandbox_id: &str,
        port: u16,
    ) -> Result<PreviewLink, SandboxError>;

    /// Send a message into the running sandbox's session.
    async fn send_message(
        &self,
        sandbox_id: &str,
        content: &str,
        message_type: MessageType,
    ) -> Result<(), SandboxError>;
}

/// The sandbox-reported progress event vocabulary (§4.7). These arrive on
/// the bus as `EventType::AgentEvent` with `kind` carried in the payload,
/// since the bus's canonical tag set treats `agent.event` as the single
/// wire tag for anything agent-sourced — `kind` is the fine-grained
/// discriminator underneath it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxEventKind {
    /// Liveness ping; resets the idle-sandbox clock but is never itself a
    /// "work" event.
    Heartbeat,
    /// The sandboxed session started.
    Started,
    /// The agent emitted a reasoning/thinking trace.
    Thinking,
    /// The agent emitted an assistant-role message.
    AssistantMessage,
    /// The agent invoked a tool.
    ToolUse,
    /// A tool invocation returned a result.
    ToolResult,
    /// The agent edited a file.
    FileEdited,
    /// A tool invocation completed.
    ToolCompleted,
    /// A subagent run completed.
    SubagentCompleted,
    /// A skill invocation completed.
    SkillCompleted,
    /// The sandbox reported an error.
    Error,
    /// The sandboxed session completed.
    Completed,
}

impl SandboxEventKind {
    /// The wire tag this kind carries under `agent.event`'s payload, e.g.
    /// `"agent.heartbeat"`.
    pub fn wire_tag(self) -> &'static str {
        match self {
            SandboxEventKind::Heartbeat => "agent.heartbeat",
            SandboxEventKind::Started => "agent.started",
            SandboxEventKind::Thinking => "agent.thinking",
            SandboxEventKind::AssistantMessage => "agent.assistant_message",
            SandboxEventKind::ToolUse => "agent.tool_use",
            SandboxEventKind::ToolResult => "agent.tool_result",
            SandboxEventKind::FileEdited => "agent.file_edited",
            SandboxEventKind::ToolCompleted => "agent.tool_completed",
            SandboxEventKind::SubagentCompleted => "agent.subagent_completed",
            SandboxEventKind::SkillCompleted => "agent.skill_completed",
            SandboxEventKind::Error => "agent.error",
            SandboxEventKind::Completed => "agent.completed",
        }
    }

    /// Whether this kind counts as "work progress" for the idle-sandbox
    /// monitor's most-recent-work-event check (§4.9): every kind except
    /// `Heartbeat`, `Started`, `Thinking`, and `Error`.
    pub fn is_work_event(self) -> bool {
        matches!(
            self,
            SandboxEventKind::FileEdited
                | SandboxEventKind::ToolCompleted
                | SandboxEventKind::SubagentCompleted
                | SandboxEventKind::SkillCompleted
                | SandboxEventKind::Completed
                | SandboxEventKind::AssistantMessage
                | SandboxEventKind::ToolUse
                | SandboxEventKind::ToolResult
        )
    }
}

/// The payload carried by an `agent.completed` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReport {
    /// The sandbox's session identifier.
    pub session_id: String,
    /// Number of conversational turns taken.
    pub turns: u32,
    /// Total cost reported by the sandbox runtime.
    pub cost_usd: f64,
    /// Prompt tokens consumed.
    pub input_tokens: u64,
    /// Completion tokens produced.
    pub output_tokens: u64,
    /// Base64-encoded transcript, if the sandbox attaches one inline.
    pub transcript_b64: Option<String>,
}

/// Build the `agent.event` [`SystemEvent`] a sandbox-facing component
/// publishes for a given [`SandboxEventKind`], tagging the payload with
/// `kind` and `sandbox_id` alongside caller-supplied detail.
pub fn sandbox_event(
    kind: SandboxEventKind,
    agent_id: EntityId,
    sandbox_id: &str,
    mut detail: Json,
) -> SystemEvent {
    if let Json::Object(map) = &mut detail {
        map.insert("kind".into(), Json::String(kind.wire_tag().into()));
        map.insert("sandbox_id".into(), Json::String(sandbox_id.into()));
    }
    SystemEvent::with_payload(EventType::AgentEvent, "agent", agent_id, detail)
}

/// Extract a `kind` discriminator previously written by [`sandbox_event`]
/// from an `agent.event` payload, if present and recognized.
pub fn event_kind(event: &SystemEvent) -> Option<SandboxEventKind> {
    let tag = event.payload.get("kind")?.as_str()?;
    ALL_KINDS.iter().copied().find(|k| k.wire_tag() == tag)
}

const ALL_KINDS: [SandboxEventKind; 12] = [
    SandboxEventKind::Heartbeat,
    SandboxEventKind::Started,
    SandboxEventKind::Thinking,
    SandboxEventKind::AssistantMessage,
    SandboxEventKind::ToolUse,
    SandboxEventKind::ToolResult,
    SandboxEventKind::FileEdited,
    SandboxEventKind::ToolCompleted,
    SandboxEventKind::SubagentCompleted,
    SandboxEventKind::SkillCompleted,
    SandboxEventKind::Error,
    SandboxEventKind::Completed,
];

/// Timestamp of an observed sandbox event, used by the idle-sandbox
/// monitor and trajectory assembly to find the most recent heartbeat or
/// work event without re-deriving it from a raw event stream each time.
#[derive(Debug, Clone, Copy)]
pub struct ObservedEvent {
    /// Which kind of event this was.
    pub kind: SandboxEventKind,
    /// When it was observed.
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tags_match_spec_vocabulary() {
        assert_eq!(SandboxEventKind::Heartbeat.wire_tag(), "agent.heartbeat");
        assert_eq!(SandboxEventKind::SubagentCompleted.wire_tag(), "agent.subagent_completed");
        assert_eq!(SandboxEventKind::Completed.wire_tag(), "agent.completed");
    }

    #[test]
    fn work_events_exclude_heartbeat_started_thinking_and_error() {
        assert!(!SandboxEventKind::Heartbeat.is_work_event());
        assert!(!SandboxEventKind::Started.is_work_event());
        assert!(!SandboxEventKind::Thinking.is_work_event());
        assert!(!SandboxEventKind::Error.is_work_event());
        assert!(SandboxEventKind::FileEdited.is_work_event());
        assert!(SandboxEventKind::ToolCompleted.is_work_event());
    }

    #[test]
    fn sandbox_event_round_trips_kind_via_payload() {
        let event = sandbox_event(
            SandboxEventKind::FileEdited,
            EntityId::new(),
            "sandbox-1",
            serde_json::json!({ "path": "src/lib.rs" }),
        );
        assert_eq!(event.event_type, EventType::AgentEvent);
        assert_eq!(event_kind(&event), Some(SandboxEventKind::FileEdited));
        assert_eq!(event.payload["sandbox_id"], "sandbox-1");
    }

    #[test]
    fn event_kind_is_none_for_untagged_payload() {
        let event = SystemEvent::with_payload(
            EventType::AgentEvent,
            "agent",
            EntityId::new(),
            serde_json::json!({}),
        );
        assert_eq!(event_kind(&event), None);
    }
}
