#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **foreman-coordination** – Coordination and synthesis primitives (§4.14)
//! for the Foreman control plane.
//!
//! [`CoordinationService`] implements the scheduling-side primitives
//! (`sync`, `split`, `join_tasks`, `register_join`, `merge_task_results`)
//! keyed by caller-chosen ids. [`SynthesisService`] is the bus listener
//! that turns a registered join into a merged result once all of its
//! source tasks complete.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use foreman_bus::{EventBus, EventType, SystemEvent};
use foreman_queue::{QueueError, TaskQueue};
use foreman_store_core::{ControlPlaneStore, StorageError};
use foreman_types::{EntityId, Task, TaskDependencies, TaskStatus, Ticket, TicketPriority};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::warn;

/// Errors raised by coordination/synthesis operations.
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    /// The backing store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The task queue failed enqueueing or updating a task.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// A source task referenced by a merge/join does not exist.
    #[error("task not found: {0}")]
    TaskNotFound(EntityId),
    /// A join/sync id was referenced that has no registered state.
    #[error("no pending coordination state for id {0}")]
    NotFound(String),
}

/// Merge strategy applied to a set of source task results (§4.14).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Flatten all non-meta keys into one map, plus `_source_results`.
    Combine,
    /// Flatten all keys; later sources in `source_task_ids` order win on
    /// conflict. No `_source_results` metadata.
    Union,
    /// Only keys present in every source; values taken from the last one.
    Intersection,
    /// Falls back to [`MergeStrategy::Combine`] since no named custom
    /// merge functions are registered.
    Custom {
        /// The (unknown) function name requested.
        name: String,
    },
}

/// Spec for a task enqueued as a split target or join continuation.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Implementation phase for the new task.
    pub phase: String,
    /// Free-form task type tag.
    pub task_type: String,
    /// Short title.
    pub title: String,
    /// Full description.
    pub description: String,
    /// Scheduling priority; defaults to the ticket's priority if `None`.
    pub priority: Option<TicketPriority>,
}

/// Status of a registered sync point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Caller-chosen id for this sync point.
    pub point_id: String,
    /// How many of `waiting_task_ids` must complete for readiness.
    pub required_count: usize,
    /// How many have completed so far.
    pub completed_count: usize,
    /// `completed_count >= required_count`.
    pub ready: bool,
    /// Whether `timeout` has elapsed without reaching readiness.
    pub expired: bool,
}

struct SyncPointState {
    waiting_task_ids: Vec<EntityId>,
    required_count: usize,
    timeout: Option<Duration>,
    created_at: DateTime<Utc>,
    ready_emitted: bool,
}

/// Implements the scheduling-side coordination primitives: `sync`,
/// `split`, `join_tasks`, `register_join`, `merge_task_results`.
pub struct CoordinationService {
    store: Arc<dyn ControlPlaneStore>,
    queue: Arc<TaskQueue>,
    bus: Arc<dyn EventBus>,
    sync_points: DashMap<String, SyncPointState>,
}

impl CoordinationService {
    /// Construct a coordination service over the given store/queue/bus.
    pub fn new(store: Arc<dyn ControlPlaneStore>, queue: Arc<TaskQueue>, bus: Arc<dyn EventBus>) -> Self {
        Self { store, queue, bus, sync_points: DashMap::new() }
    }

    /// Register or re-evaluate a sync point: ready once `required_count`
    /// (default: all) of `waiting_task_ids` are `completed`.
    pub async fn sync(
        &self,
        point_id: impl Into<String>,
        waiting_task_ids: Vec<EntityId>,
        required_count: Option<usize>,
        timeout: Option<Duration>,
    ) -> Result<SyncStatus, CoordinationError> {
        let point_id = point_id.into();
        let required_count = required_count.unwrap_or(waiting_task_ids.len());
        let is_new = !self.sync_points.contains_key(&point_id);

        if is_new {
            self.sync_points.insert(
                point_id.clone(),
                SyncPointState {
                    waiting_task_ids: waiting_task_ids.clone(),
                    required_count,
                    timeout,
                    created_at: Utc::now(),
                    ready_emitted: false,
                },
            );
            let _ = self.bus.publish(&SystemEvent::with_payload(
                EventType::CoordinationSyncCreated,
                "sync_point",
                EntityId::new(),
                serde_json::json!({ "point_id": point_id, "required_count": required_count }),
            ));
        }

        let mut completed_count = 0;
        for task_id in &waiting_task_ids {
            if let Some(task) = self.store.get_task(*task_id).await? {
                if task.status == TaskStatus::Completed {
                    completed_count += 1;
                }
            }
        }

        let ready = completed_count >= required_count;
        let expired = {
            let entry = self.sync_points.get(&point_id).ok_or_else(|| CoordinationError::NotFound(point_id.clone()))?;
            match entry.timeout {
                Some(timeout) => !ready && (Utc::now() - entry.created_at).to_std().unwrap_or_default() > timeout,
                None => false,
            }
        };

        if ready {
            let mut entry = self.sync_points.get_mut(&point_id).unwrap();
            if !entry.ready_emitted {
                entry.ready_emitted = true;
                drop(entry);
                let _ = self.bus.publish(&SystemEvent::with_payload(
                    EventType::CoordinationSyncReady,
                    "sync_point",
                    EntityId::new(),
                    serde_json::json!({ "point_id": point_id }),
                ));
            }
        }

        Ok(SyncStatus { point_id, required_count, completed_count, ready, expired })
    }

    /// Fan `source_task` out into `target_tasks`, each depending on it.
    pub async fn split(
        &self,
        split_id: impl Into<String>,
        ticket: &Ticket,
        source_task: &Task,
        target_tasks: Vec<TaskSpec>,
        required_capabilities: Option<Vec<String>>,
    ) -> Result<Vec<Task>, CoordinationError> {
        let split_id = split_id.into();
        let mut created = Vec::with_capacity(target_tasks.len());
        for spec in target_tasks {
            let mut task = self
                .queue
                .enqueue_task(
                    ticket,
                    spec.phase,
                    spec.task_type,
                    spec.title,
                    spec.description,
                    spec.priority,
                    TaskDependencies::new(vec![source_task.id]),
                )
                .await?;
            if let Some(caps) = &required_capabilities {
                task.result = Some(serde_json::json!({ "required_capabilities": caps }));
                self.store.update_task(&task).await?;
            }
            created.push(task);
        }

        let _ = self.bus.publish(&SystemEvent::with_payload(
            EventType::CoordinationSplitCreated,
            "task",
            source_task.id,
            serde_json::json!({ "split_id": split_id, "target_count": created.len() }),
        ));
        Ok(created)
    }

    /// Enqueue a new continuation task gated on `source_task_ids`, and
    /// register it for synthesis.
    pub async fn join_tasks(
        &self,
        join_id: impl Into<String>,
        ticket: &Ticket,
        source_task_ids: Vec<EntityId>,
        continuation: TaskSpec,
        merge_strategy: MergeStrategy,
    ) -> Result<Task, CoordinationError> {
        let continuation_task = self
            .queue
            .enqueue_task(
                ticket,
                continuation.phase,
                continuation.task_type,
                continuation.title,
                continuation.description,
                continuation.priority,
                TaskDependencies::new(source_task_ids.clone()),
            )
            .await?;

        self.emit_join_created(join_id, source_task_ids, continuation_task.id, merge_strategy);
        Ok(continuation_task)
    }

    /// Augment an already-existing continuation task's dependencies with
    /// `source_task_ids` and register it for synthesis. Creates no task.
    pub async fn register_join(
        &self,
        join_id: impl Into<String>,
        source_task_ids: Vec<EntityId>,
        continuation_task_id: EntityId,
        merge_strategy: MergeStrategy,
    ) -> Result<(), CoordinationError> {
        let mut continuation = self
            .store
            .get_task(continuation_task_id)
            .await?
            .ok_or(CoordinationError::TaskNotFound(continuation_task_id))?;

        let mut depends_on = continuation.dependencies.depends_on.clone();
        for id in &source_task_ids {
            if !depends_on.contains(id) {
                depends_on.push(*id);
            }
        }
        continuation.dependencies = TaskDependencies::new(depends_on);
        continuation.updated_at = Utc::now();
        self.store.update_task(&continuation).await?;

        self.emit_join_created(join_id, source_task_ids, continuation_task_id, merge_strategy);
        Ok(())
    }

    fn emit_join_created(
        &self,
        join_id: impl Into<String>,
        source_task_ids: Vec<EntityId>,
        continuation_task_id: EntityId,
        merge_strategy: MergeStrategy,
    ) {
        let join_id = join_id.into();
        let _ = self.bus.publish(&SystemEvent::with_payload(
            EventType::CoordinationJoinCreated,
            "task",
            continuation_task_id,
            serde_json::json!({
                "join_id": join_id,
                "source_task_ids": source_task_ids,
                "continuation_task_id": continuation_task_id,
                "merge_strategy": merge_strategy,
            }),
        ));
    }

    /// Merge the results of `source_task_ids` per `strategy`.
    pub async fn merge_task_results(
        &self,
        source_task_ids: &[EntityId],
        strategy: &MergeStrategy,
    ) -> Result<Json, CoordinationError> {
        let mut results = Vec::with_capacity(source_task_ids.len());
        for id in source_task_ids {
            let task = self.store.get_task(*id).await?.ok_or(CoordinationError::TaskNotFound(*id))?;
            results.push((*id, task.result.unwrap_or(Json::Object(Map::new()))));
        }

        let merged = match strategy {
            MergeStrategy::Combine | MergeStrategy::Custom { .. } => combine(&results),
            MergeStrategy::Union => union(&results),
            MergeStrategy::Intersection => intersection(&results),
        };
        let _ = self.bus.publish(&SystemEvent::with_payload(
            EventType::CoordinationMergeCompleted,
            "task",
            source_task_ids.first().copied().unwrap_or_else(EntityId::new),
            serde_json::json!({ "source_task_ids": source_task_ids }),
        ));
        Ok(merged)
    }
}

fn as_object(value: &Json) -> Map<String, Json> {
    match value {
        Json::Object(map) => map.clone(),
        _ => Map::new(),
    }
}

fn combine(results: &[(EntityId, Json)]) -> Json {
    let mut merged = Map::new();
    for (_, value) in results {
        for (k, v) in as_object(value) {
            merged.insert(k, v);
        }
    }
    let source_results: Map<String, Json> =
        results.iter().map(|(id, value)| (id.to_string(), value.clone())).collect();
    merged.insert("_source_results".to_string(), Json::Object(source_results));
    Json::Object(merged)
}

fn union(results: &[(EntityId, Json)]) -> Json {
    let mut merged = Map::new();
    for (_, value) in results {
        for (k, v) in as_object(value) {
            merged.insert(k, v);
        }
    }
    Json::Object(merged)
}

fn intersection(results: &[(EntityId, Json)]) -> Json {
    let objects: Vec<Map<String, Json>> = results.iter().map(|(_, value)| as_object(value)).collect();
    let Some(first) = objects.first() else { return Json::Object(Map::new()) };

    let mut merged = Map::new();
    for key in first.keys() {
        if objects.iter().all(|obj| obj.contains_key(key)) {
            let last_value = objects.last().unwrap().get(key).cloned().unwrap();
            merged.insert(key.clone(), last_value);
        }
    }
    Json::Object(merged)
}

#[derive(Debug, Clone)]
struct PendingJoin {
    source_ids: HashSet<EntityId>,
    completed_ids: HashSet<EntityId>,
    continuation_id: EntityId,
    strategy: MergeStrategy,
}

/// Listens for `coordination.join.created` and `TASK_COMPLETED`, tracks
/// pending joins, and writes the merged result into each continuation
/// task's `synthesis_context` once every source task has completed.
pub struct SynthesisService {
    store: Arc<dyn ControlPlaneStore>,
    queue: Arc<TaskQueue>,
    bus: Arc<dyn EventBus>,
    pending: DashMap<String, PendingJoin>,
}

impl SynthesisService {
    /// Construct a synthesis service over the given store/queue/bus.
    pub fn new(store: Arc<dyn ControlPlaneStore>, queue: Arc<TaskQueue>, bus: Arc<dyn EventBus>) -> Self {
        Self { store, queue, bus, pending: DashMap::new() }
    }

    /// Feed one bus event into the synthesis state machine.
    pub async fn handle_event(&self, event: &SystemEvent) -> Result<(), CoordinationError> {
        match &event.event_type {
            EventType::CoordinationJoinCreated => self.on_join_created(event).await,
            EventType::TaskCompleted => self.on_task_completed(event).await,
            _ => Ok(()),
        }
    }

    async fn on_join_created(&self, event: &SystemEvent) -> Result<(), CoordinationError> {
        let Some(join_id) = event.payload.get("join_id").and_then(|v| v.as_str()) else { return Ok(()) };
        let Some(source_ids) = event.payload.get("source_task_ids").and_then(|v| v.as_array()) else {
            return Ok(());
        };
        let source_ids: HashSet<EntityId> = source_ids
            .iter()
            .filter_map(|v| serde_json::from_value::<EntityId>(v.clone()).ok())
            .collect();
        let continuation_id = event.entity_id;
        let strategy: MergeStrategy = event
            .payload
            .get("merge_strategy")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(MergeStrategy::Combine);

        let mut completed_ids = HashSet::new();
        for id in &source_ids {
            if let Some(task) = self.store.get_task(*id).await? {
                if task.status == TaskStatus::Completed {
                    completed_ids.insert(*id);
                }
            }
        }

        let ready = completed_ids.is_superset(&source_ids) && !source_ids.is_empty();
        self.pending.insert(
            join_id.to_string(),
            PendingJoin { source_ids: source_ids.clone(), completed_ids, continuation_id, strategy },
        );

        if ready {
            self.attempt_synthesis(join_id).await;
        }
        Ok(())
    }

    async fn on_task_completed(&self, event: &SystemEvent) -> Result<(), CoordinationError> {
        let task_id = event.entity_id;
        let mut ready_joins = Vec::new();
        for mut entry in self.pending.iter_mut() {
            if entry.value().source_ids.contains(&task_id) {
                entry.value_mut().completed_ids.insert(task_id);
                if entry.value().completed_ids.is_superset(&entry.value().source_ids) {
                    ready_joins.push(entry.key().clone());
                }
            }
        }
        for join_id in ready_joins {
            self.attempt_synthesis(&join_id).await;
        }
        Ok(())
    }

    async fn attempt_synthesis(&self, join_id: &str) {
        if let Err(err) = self.synthesize(join_id).await {
            warn!(join_id, error = %err, "synthesis failed");
            let _ = self.bus.publish(&SystemEvent::with_payload(
                EventType::CoordinationSynthesisFailed,
                "join",
                EntityId::new(),
                serde_json::json!({ "join_id": join_id, "error": err.to_string() }),
            ));
        }
    }

    async fn synthesize(&self, join_id: &str) -> Result<(), CoordinationError> {
        let pending = self
            .pending
            .get(join_id)
            .ok_or_else(|| CoordinationError::NotFound(join_id.to_string()))?
            .clone();

        let source_ids: Vec<EntityId> = pending.source_ids.iter().copied().collect();
        let coordination = CoordinationService::new(self.store.clone(), self.queue.clone(), self.bus.clone());
        let merged = coordination.merge_task_results(&source_ids, &pending.strategy).await?;

        let mut continuation = self
            .store
            .get_task(pending.continuation_id)
            .await?
            .ok_or(CoordinationError::TaskNotFound(pending.continuation_id))?;

        let mut merged_map = as_object(&merged);
        merged_map.insert("_injected_at".to_string(), serde_json::json!(Utc::now()));
        merged_map.insert("_join_id".to_string(), serde_json::json!(join_id));
        merged_map.insert("_source_task_ids".to_string(), serde_json::json!(source_ids));
        continuation.synthesis_context = Some(Json::Object(merged_map));
        continuation.updated_at = Utc::now();
        self.store.update_task(&continuation).await?;

        let _ = self.bus.publish(&SystemEvent::with_payload(
            EventType::CoordinationSynthesisCompleted,
            "task",
            pending.continuation_id,
            serde_json::json!({ "join_id": join_id }),
        ));

        self.pending.remove(join_id);
        Ok(())
    }

    /// Run forever: feed every bus event into [`Self::handle_event`].
    pub async fn run(&self) {
        let mut events = self.bus.subscribe();
        while let Ok(event) = events.recv().await {
            if let Err(err) = self.handle_event(&event).await {
                warn!(error = %err, "synthesis event handling failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_bus::InMemoryBus;
    use foreman_store_memory::MemoryStore;
    use foreman_types::TaskDependencies;

    fn harness() -> (Arc<dyn ControlPlaneStore>, Arc<TaskQueue>, Arc<dyn EventBus>) {
        let store: Arc<dyn ControlPlaneStore> = Arc::new(MemoryStore::new());
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new(64));
        let queue = Arc::new(TaskQueue::new(store.clone(), bus.clone()));
        (store, queue, bus)
    }

    async fn make_ticket_and_task(store: &Arc<dyn ControlPlaneStore>) -> (Ticket, Task) {
        let ticket =
            Ticket::new("t", "d", "backend", TicketPriority::Medium, EntityId::new(), EntityId::new()).unwrap();
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
        (ticket, task)
    }

    #[tokio::test]
    async fn sync_is_ready_once_required_count_completed() {
        let (store, queue, bus) = harness();
        let (_ticket, mut a) = make_ticket_and_task(&store).await;
        a.status = TaskStatus::Completed;
        store.update_task(&a).await.unwrap();

        let coordination = CoordinationService::new(store, queue, bus);
        let status = coordination.sync("sp-1", vec![a.id], None, None).await.unwrap();
        assert!(status.ready);
        assert_eq!(status.completed_count, 1);
    }

    #[tokio::test]
    async fn split_creates_dependent_targets() {
        let (store, queue, bus) = harness();
        let (ticket, source) = make_ticket_and_task(&store).await;
        let coordination = CoordinationService::new(store, queue, bus);

        let targets = coordination
            .split(
                "split-1",
                &ticket,
                &source,
                vec![TaskSpec {
                    phase: "backend".into(),
                    task_type: "implement_feature".into(),
                    title: "part 1".into(),
                    description: "d".into(),
                    priority: None,
                }],
                None,
            )
            .await
            .unwrap();

        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].dependencies.depends_on, vec![source.id]);
    }

    #[test]
    fn combine_merges_and_keeps_source_results() {
        let a = EntityId::new();
        let b = EntityId::new();
        let results = vec![(a, serde_json::json!({"x": 1})), (b, serde_json::json!({"y": 2}))];
        let merged = combine(&results);
        assert_eq!(merged["x"], 1);
        assert_eq!(merged["y"], 2);
        assert!(merged["_source_results"].is_object());
    }

    #[test]
    fn union_has_no_source_results_metadata() {
        let a = EntityId::new();
        let b = EntityId::new();
        let results = vec![(a, serde_json::json!({"x": 1})), (b, serde_json::json!({"x": 2}))];
        let merged = union(&results);
        assert_eq!(merged["x"], 2);
        assert!(merged.get("_source_results").is_none());
    }

    #[test]
    fn intersection_keeps_only_shared_keys_with_last_value() {
        let a = EntityId::new();
        let b = EntityId::new();
        let results =
            vec![(a, serde_json::json!({"x": 1, "only_a": true})), (b, serde_json::json!({"x": 2, "only_b": true}))];
        let merged = intersection(&results);
        assert_eq!(merged["x"], 2);
        assert!(merged.get("only_a").is_none());
        assert!(merged.get("only_b").is_none());
    }

    #[tokio::test]
    async fn synthesis_fires_once_all_sources_complete() {
        let (store, queue, bus) = harness();
        let (ticket, source_a) = make_ticket_and_task(&store).await;
        let mut source_b = Task::new(
            ticket.id,
            "backend",
            "implement_feature",
            "t2",
            "d2",
            TicketPriority::Medium,
            TaskDependencies::none(),
        );
        store.insert_task(&source_b).await.unwrap();

        let coordination = CoordinationService::new(store.clone(), queue.clone(), bus.clone());
        let continuation = coordination
            .join_tasks(
                "join-1",
                &ticket,
                vec![source_a.id, source_b.id],
                TaskSpec {
                    phase: "backend".into(),
                    task_type: "continue".into(),
                    title: "continuation".into(),
                    description: "d".into(),
                    priority: None,
                },
                MergeStrategy::Combine,
            )
            .await
            .unwrap();

        let synthesis = SynthesisService::new(store.clone(), queue.clone(), bus.clone());
        let mut events = bus.subscribe();
        let join_created = events.recv().await.unwrap();
        synthesis.handle_event(&join_created).await.unwrap();

        let mut a = store.get_task(source_a.id).await.unwrap().unwrap();
        a.result = Some(serde_json::json!({"out": "a"}));
        a.status = TaskStatus::Completed;
        store.update_task(&a).await.unwrap();
        let completed_a = SystemEvent::with_payload(EventType::TaskCompleted, "task", a.id, serde_json::json!({}));
        synthesis.handle_event(&completed_a).await.unwrap();

        source_b.result = Some(serde_json::json!({"out": "b"}));
        source_b.status = TaskStatus::Completed;
        store.update_task(&source_b).await.unwrap();
        let completed_b =
            SystemEvent::with_payload(EventType::TaskCompleted, "task", source_b.id, serde_json::json!({}));
        synthesis.handle_event(&completed_b).await.unwrap();

        let continuation = store.get_task(continuation.id).await.unwrap().unwrap();
        let ctx = continuation.synthesis_context.unwrap();
        assert_eq!(ctx["out"], "b");
        assert_eq!(ctx["_join_id"], "join-1");
    }
}
