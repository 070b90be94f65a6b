#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **foreman-validator** – Validator Pipeline (§4.15) for the Foreman
//! control plane.
//!
//! Wraps task completion: counts Validation Reviews to decide whether a
//! task is retried, marked `pending_validation`, or failed outright, then
//! applies the pass/fail transition a validator sandbox reports back.
//! Does not spawn sandboxes itself; the Orchestrator Worker discovers
//! `pending_validation` tasks by polling `get_next_validation_task`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use foreman_bus::{EventBus, EventType, SystemEvent};
use foreman_queue::{QueueError, TaskQueue};
use foreman_sandbox::SpawnRequest;
use foreman_store_core::StorageError;
use foreman_types::{EntityId, Task, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::info;

/// Default for `validation_enabled`.
pub const DEFAULT_VALIDATION_ENABLED: bool = true;
/// Default for `max_validation_iterations`.
pub const DEFAULT_MAX_VALIDATION_ITERATIONS: u32 = 3;

/// Configuration for the validator pipeline.
#[derive(Debug, Clone, Copy)]
pub struct ValidatorConfig {
    /// Whether validation is applied at all; if `false`,
    /// [`ValidatorPipeline::submit_for_validation`] completes the task
    /// directly.
    pub validation_enabled: bool,
    /// Maximum number of validation iterations before a task is failed
    /// outright.
    pub max_validation_iterations: u32,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            validation_enabled: DEFAULT_VALIDATION_ENABLED,
            max_validation_iterations: DEFAULT_MAX_VALIDATION_ITERATIONS,
        }
    }
}

/// Errors raised by the validator pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    /// The backing store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The task queue failed applying a status transition.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// One recorded validator verdict against a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReview {
    /// 1-based iteration this review belongs to.
    pub iteration_number: u32,
    /// Whether the validator accepted the implementation.
    pub passed: bool,
    /// Free-form validator commentary.
    pub feedback: String,
    /// Supporting evidence (logs, test output, …), if any.
    pub evidence: Option<Json>,
    /// Suggested next steps, if the validator offered any.
    pub recommendations: Option<Vec<String>>,
    /// When the review was recorded.
    pub reviewed_at: chrono::DateTime<Utc>,
}

/// Counts Validation Reviews per task and applies the pass/fail
/// transitions a validator sandbox reports.
pub struct ValidatorPipeline {
    queue: Arc<TaskQueue>,
    bus: Arc<dyn EventBus>,
    config: ValidatorConfig,
    reviews: DashMap<EntityId, Vec<ValidationReview>>,
}

impl ValidatorPipeline {
    /// Construct a pipeline with the default configuration.
    pub fn new(queue: Arc<TaskQueue>, bus: Arc<dyn EventBus>) -> Self {
        Self { queue, bus, config: ValidatorConfig::default(), reviews: DashMap::new() }
    }

    /// Construct a pipeline with an explicit configuration.
    pub fn with_config(queue: Arc<TaskQueue>, bus: Arc<dyn EventBus>, config: ValidatorConfig) -> Self {
        Self { queue, bus, config, reviews: DashMap::new() }
    }

    /// All Validation Reviews recorded for `task_id`, oldest first.
    pub fn reviews_for(&self, task_id: EntityId) -> Vec<ValidationReview> {
        self.reviews.get(&task_id).map(|entry| entry.clone()).unwrap_or_default()
    }

    fn next_iteration(&self, task_id: EntityId) -> u32 {
        self.reviews.get(&task_id).map(|entry| entry.len() as u32).unwrap_or(0) + 1
    }

    /// On `agent.completed`: count prior reviews, and either fail the task
    /// outright (iteration budget exhausted) or move it to
    /// `pending_validation` carrying the implementation result.
    pub async fn submit_for_validation(
        &self,
        task: Task,
        implementation_result: Json,
    ) -> Result<Task, ValidatorError> {
        if !self.config.validation_enabled {
            let task = self
                .queue
                .update_task_status(task, TaskStatus::Completed, Some(implementation_result), None, None)
                .await?;
            return Ok(task);
        }

        let iteration = self.next_iteration(task.id);
        if iteration > self.config.max_validation_iterations {
            let task = self
                .queue
                .update_task_status(
                    task,
                    TaskStatus::Failed,
                    None,
                    Some(format!("Failed validation after {} iterations", self.config.max_validation_iterations)),
                    None,
                )
                .await?;
            return Ok(task);
        }

        let mut result = match implementation_result {
            Json::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("implementation_result".to_string(), other);
                map
            }
        };
        result.insert("validation_iteration".to_string(), serde_json::json!(iteration));

        let task = self
            .queue
            .update_task_status(task, TaskStatus::PendingValidation, Some(Json::Object(result)), None, None)
            .await?;
        Ok(task)
    }

    /// Apply a validator sandbox's verdict (§4.15's
    /// `handle_validation_result`): record the review, then transition the
    /// task to `completed` (pass) or `needs_revision` (fail).
    #[allow(clippy::too_many_arguments)]
    pub async fn handle_validation_result(
        &self,
        task: Task,
        validator_agent: EntityId,
        passed: bool,
        feedback: String,
        evidence: Option<Json>,
        recommendations: Option<Vec<String>>,
    ) -> Result<Task, ValidatorError> {
        let iteration = self.next_iteration(task.id);
        self.reviews.entry(task.id).or_default().push(ValidationReview {
            iteration_number: iteration,
            passed,
            feedback: feedback.clone(),
            evidence: evidence.clone(),
            recommendations: recommendations.clone(),
            reviewed_at: Utc::now(),
        });

        info!(task_id = %task.id, %validator_agent, iteration, passed, "validation review recorded");

        let mut result = match &task.result {
            Some(Json::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        };

        if passed {
            result.insert("validation_passed".to_string(), serde_json::json!(true));
            result.insert("validated_at".to_string(), serde_json::json!(Utc::now()));
            result.insert("validation_iteration".to_string(), serde_json::json!(iteration));

            let task = self
                .queue
                .update_task_status(task, TaskStatus::Completed, Some(Json::Object(result)), None, None)
                .await?;
            let _ = self.bus.publish(&SystemEvent::new(EventType::TaskValidationPassed, "task", task.id));
            Ok(task)
        } else {
            result.insert("revision_feedback".to_string(), serde_json::json!(feedback));
            if let Some(recommendations) = &recommendations {
                result.insert("revision_recommendations".to_string(), serde_json::json!(recommendations));
            }

            let task = self
                .queue
                .update_task_status(task, TaskStatus::NeedsRevision, Some(Json::Object(result)), None, None)
                .await?;
            let _ = self.bus.publish(&SystemEvent::new(EventType::TaskValidationFailed, "task", task.id));
            Ok(task)
        }
    }
}

/// Build the environment injected into a validator sandbox (§4.15): the
/// required `VALIDATION_MODE`/`ORIGINAL_TASK_ID`/`VALIDATION_ITERATION`/
/// `ORIGINAL_SANDBOX_ID` plus whichever VCS/user fields are available.
#[derive(Debug, Clone, Default)]
pub struct ValidatorSandboxContext {
    /// The task under validation.
    pub original_task_id: EntityId,
    /// Which validation iteration this sandbox is running.
    pub validation_iteration: u32,
    /// The sandbox that produced the implementation under review.
    pub original_sandbox_id: String,
    /// Source repository, `owner/name` form, if known.
    pub github_repo: Option<String>,
    /// Source repository owner, if known.
    pub github_repo_owner: Option<String>,
    /// Source repository name, if known.
    pub github_repo_name: Option<String>,
    /// Branch the implementation landed on, if known.
    pub branch_name: Option<String>,
    /// Token scoped for the validator sandbox's VCS access, if provisioned.
    pub github_token: Option<String>,
    /// The requesting user, if known.
    pub user_id: Option<EntityId>,
}

impl ValidatorSandboxContext {
    /// Render this context as the `extra_env` map for a [`SpawnRequest`].
    pub fn to_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("VALIDATION_MODE".to_string(), "true".to_string());
        env.insert("ORIGINAL_TASK_ID".to_string(), self.original_task_id.to_string());
        env.insert("VALIDATION_ITERATION".to_string(), self.validation_iteration.to_string());
        env.insert("ORIGINAL_SANDBOX_ID".to_string(), self.original_sandbox_id.clone());
        if let Some(v) = &self.github_repo {
            env.insert("GITHUB_REPO".to_string(), v.clone());
        }
        if let Some(v) = &self.github_repo_owner {
            env.insert("GITHUB_REPO_OWNER".to_string(), v.clone());
        }
        if let Some(v) = &self.github_repo_name {
            env.insert("GITHUB_REPO_NAME".to_string(), v.clone());
        }
        if let Some(v) = &self.branch_name {
            env.insert("BRANCH_NAME".to_string(), v.clone());
        }
        if let Some(v) = &self.github_token {
            env.insert("GITHUB_TOKEN".to_string(), v.clone());
        }
        if let Some(v) = &self.user_id {
            env.insert("USER_ID".to_string(), v.to_string());
        }
        env
    }

    /// Apply this context onto a spawn request's `extra_env`, merging with
    /// (and overriding on conflict) whatever the caller already set.
    pub fn apply_to(&self, request: &mut SpawnRequest) {
        let mut env = request.extra_env.take().unwrap_or_default();
        env.extend(self.to_env());
        request.extra_env = Some(env);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_bus::InMemoryBus;
    use foreman_store_core::ControlPlaneStore;
    use foreman_store_memory::MemoryStore;
    use foreman_types::{TaskDependencies, Ticket, TicketPriority};

    async fn harness() -> (Arc<TaskQueue>, Arc<dyn EventBus>, Ticket, Task) {
        let store: Arc<dyn ControlPlaneStore> = Arc::new(MemoryStore::new());
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new(64));
        let queue = Arc::new(TaskQueue::new(store.clone(), bus.clone()));
        let ticket =
            Ticket::new("t", "d", "backend", TicketPriority::Medium, EntityId::new(), EntityId::new()).unwrap();
        store.insert_ticket(&ticket).await.unwrap();
        let task = queue
            .enqueue_task(&ticket, "backend", "implement_feature", "t", "d", None, TaskDependencies::none())
            .await
            .unwrap();
        (queue, bus, ticket, task)
    }

    #[tokio::test]
    async fn submit_for_validation_moves_task_to_pending_validation() {
        let (queue, bus, _ticket, task) = harness().await;
        let pipeline = ValidatorPipeline::new(queue, bus);
        let task = pipeline.submit_for_validation(task, serde_json::json!({"diff": "x"})).await.unwrap();
        assert_eq!(task.status, TaskStatus::PendingValidation);
        assert_eq!(task.result.unwrap()["validation_iteration"], 1);
    }

    #[tokio::test]
    async fn exceeding_max_iterations_fails_the_task() {
        let (queue, bus, _ticket, task) = harness().await;
        let pipeline =
            ValidatorPipeline::with_config(queue, bus, ValidatorConfig { validation_enabled: true, max_validation_iterations: 0 });
        let task = pipeline.submit_for_validation(task, serde_json::json!({})).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_message.unwrap(), "Failed validation after 0 iterations");
    }

    #[tokio::test]
    async fn passed_validation_completes_the_task() {
        let (queue, bus, _ticket, task) = harness().await;
        let pipeline = ValidatorPipeline::new(queue, bus);
        let task = pipeline.submit_for_validation(task, serde_json::json!({})).await.unwrap();
        let task = pipeline
            .handle_validation_result(task, EntityId::new(), true, "looks good".into(), None, None)
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.unwrap()["validation_passed"], true);
    }

    #[tokio::test]
    async fn failed_validation_requests_revision() {
        let (queue, bus, _ticket, task) = harness().await;
        let pipeline = ValidatorPipeline::new(queue, bus);
        let task = pipeline.submit_for_validation(task, serde_json::json!({})).await.unwrap();
        let task = pipeline
            .handle_validation_result(
                task,
                EntityId::new(),
                false,
                "tests fail".into(),
                None,
                Some(vec!["fix the off-by-one".into()]),
            )
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::NeedsRevision);
        assert_eq!(task.result.unwrap()["revision_feedback"], "tests fail");
    }

    #[test]
    fn validator_sandbox_context_renders_required_and_optional_vars() {
        let ctx = ValidatorSandboxContext {
            original_task_id: EntityId::new(),
            validation_iteration: 2,
            original_sandbox_id: "sbx-1".into(),
            github_repo: Some("acme/widgets".into()),
            ..Default::default()
        };
        let env = ctx.to_env();
        assert_eq!(env["VALIDATION_MODE"], "true");
        assert_eq!(env["VALIDATION_ITERATION"], "2");
        assert_eq!(env["GITHUB_REPO"], "acme/widgets");
        assert!(!env.contains_key("BRANCH_NAME"));
    }
}
