#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **foreman-cost** – Cost and budget engine for the Foreman control
//! plane (§4.6), plus budget-threshold-driven alerting.
//!
//! [`CostEngine`] prices and persists every reported LLM turn or
//! sandbox-reported cost, then walks every [`foreman_types::Budget`] whose
//! scope covers the record and applies the spend, emitting `cost.recorded`
//! and, where crossed, `cost.budget.warning` / `cost.budget.exceeded`.
//! [`alerting::AlertService`] turns budget-threshold crossings (and other
//! metric observations) into [`alerting::Alert`]s that can be
//! acknowledged and resolved.

pub mod alerting;

use std::sync::Arc;

use foreman_bus::{EventBus, EventType, SystemEvent};
use foreman_store_core::{ControlPlaneStore, StorageError};
use foreman_types::{Budget, BudgetScope, CostRecord, EntityId};

/// Errors raised by [`CostEngine`] operations.
#[derive(Debug, thiserror::Error)]
pub enum CostError {
    /// The backing store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The referenced task does not exist, so its ticket/phase scopes
    /// cannot be resolved.
    #[error("task not found: {0}")]
    TaskNotFound(EntityId),
}

/// Cost and budget engine: pricing, persistence, and scoped budget
/// updates (§4.6).
pub struct CostEngine {
    store: Arc<dyn ControlPlaneStore>,
    bus: Arc<dyn EventBus>,
}

impl CostEngine {
    /// Construct a cost engine backed by `store` and `bus`.
    pub fn new(store: Arc<dyn ControlPlaneStore>, bus: Arc<dyn EventBus>) -> Self {
        Self { store, bus }
    }

    /// Price a reported LLM turn, persist the record, and apply spend to
    /// every covering budget. Returns the persisted record.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_token_usage(
        &self,
        task_id: EntityId,
        agent_id: Option<EntityId>,
        sandbox_id: Option<String>,
        billing_account: Option<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        prompt_tokens: u64,
        completion_tokens: u64,
        prompt_token_cost: f64,
        completion_token_cost: f64,
    ) -> Result<CostRecord, CostError> {
        let record = CostRecord::from_token_usage(
            task_id,
            agent_id,
            sandbox_id,
            billing_account,
            provider,
            model,
            prompt_tokens,
            completion_tokens,
            prompt_token_cost,
            completion_token_cost,
        );
        self.persist_and_apply(record).await
    }

    /// Price a sandbox-reported `cost_usd` total using the 30/70
    /// prompt/completion split convention, persist it, and apply spend.
    pub async fn record_sandbox_cost(
        &self,
        task_id: EntityId,
        agent_id: Option<EntityId>,
        sandbox_id: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        cost_usd: f64,
    ) -> Result<CostRecord, CostError> {
        let record =
            CostRecord::from_sandbox_report(task_id, agent_id, sandbox_id, provider, model, cost_usd);
        self.persist_and_apply(record).await
    }

    async fn persist_and_apply(&self, record: CostRecord) -> Result<CostRecord, CostError> {
        self.store.insert_cost_record(&record).await?;
        let _ = self.bus.publish(&SystemEvent::with_payload(
            EventType::CostRecorded,
            "cost_record",
            record.id,
            serde_json::json!({ "task_id": record.task_id, "total_cost": record.total_cost }),
        ));

        for scope in self.covering_scopes(&record).await? {
            self.apply_spend_to_scope(scope, record.total_cost).await?;
        }

        Ok(record)
    }

    /// Resolve the `(scope_type, scope_id)` pairs that cover `record`:
    /// global always, the agent directly (if known), and the task's
    /// owning ticket and phase.
    async fn covering_scopes(
        &self,
        record: &CostRecord,
    ) -> Result<Vec<(BudgetScope, Option<String>)>, CostError> {
        let mut scopes = vec![(BudgetScope::Global, None)];
        if let Some(agent_id) = record.agent_id {
            scopes.push((BudgetScope::Agent, Some(agent_id.to_string())));
        }
        let task = self
            .store
            .get_task(record.task_id)
            .await?
            .ok_or(CostError::TaskNotFound(record.task_id))?;
        scopes.push((BudgetScope::Ticket, Some(task.ticket_id.to_string())));
        scopes.push((BudgetScope::Phase, Some(task.phase.clone())));
        Ok(scopes)
    }

    async fn apply_spend_to_scope(
        &self,
        (scope_type, scope_id): (BudgetScope, Option<String>),
        amount: f64,
    ) -> Result<(), CostError> {
        let budgets = self
            .store
            .list_budgets_for_scope(scope_type, scope_id)
            .await?;
        for mut budget in budgets {
            let outcome = budget.apply_spend(amount);
            self.store.update_budget(&budget).await?;

            if outcome.crossed_alert_threshold {
                let _ = self.bus.publish(&SystemEvent::with_payload(
                    EventType::CostBudgetWarning,
                    "budget",
                    budget.id,
                    serde_json::json!({
                        "spent_amount": budget.spent_amount,
                        "limit_amount": budget.limit_amount,
                        "alert_threshold": budget.alert_threshold,
                    }),
                ));
            }
            if outcome.exceeded {
                let _ = self.bus.publish(&SystemEvent::with_payload(
                    EventType::CostBudgetExceeded,
                    "budget",
                    budget.id,
                    serde_json::json!({
                        "spent_amount": budget.spent_amount,
                        "limit_amount": budget.limit_amount,
                    }),
                ));
            }
        }
        Ok(())
    }

    /// Create and persist a new budget, emitting `budget.created`.
    pub async fn create_budget(&self, budget: Budget) -> Result<Budget, CostError> {
        self.store.insert_budget(&budget).await?;
        let _ = self.bus.publish(&SystemEvent::new(EventType::BudgetCreated, "budget", budget.id));
        Ok(budget)
    }

    /// `is_budget_available(scope, estimated_cost)`: `true` if no budget
    /// exists for the scope, else `(spent + estimated_cost) <= limit`
    /// for every budget in that scope.
    pub async fn is_budget_available(
        &self,
        scope_type: BudgetScope,
        scope_id: Option<String>,
        estimated_cost: f64,
    ) -> Result<bool, CostError> {
        let budgets = self.store.list_budgets_for_scope(scope_type, scope_id).await?;
        if budgets.is_empty() {
            return Ok(true);
        }
        Ok(budgets.iter().all(|b| b.has_room_for(estimated_cost)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_bus::InMemoryBus;
    use foreman_store_memory::MemoryStore;
    use foreman_types::{Task, TaskDependencies, Ticket, TicketPriority};

    async fn harness() -> (CostEngine, Arc<dyn ControlPlaneStore>, EntityId, EntityId) {
        let store: Arc<dyn ControlPlaneStore> = Arc::new(MemoryStore::new());
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new(64));

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

        (CostEngine::new(store.clone(), bus), store, ticket.id, task.id)
    }

    #[tokio::test]
    async fn record_token_usage_persists_and_prices_correctly() {
        let (engine, _store, _ticket_id, task_id) = harness().await;
        let record = engine
            .record_token_usage(
                task_id,
                None,
                None,
                None,
                "anthropic",
                "claude-opus-4",
                1000,
                500,
                0.000015,
                0.000075,
            )
            .await
            .unwrap();
        assert_eq!(record.total_tokens, 1500);
        assert!(record.total_cost > 0.0);
    }

    #[tokio::test]
    async fn spend_applies_to_global_ticket_and_phase_budgets() {
        let (engine, store, ticket_id, task_id) = harness().await;

        let global = Budget::new(BudgetScope::Global, None, 1000.0, None);
        let ticket_budget = Budget::new(BudgetScope::Ticket, Some(ticket_id.to_string()), 1000.0, None);
        let phase_budget = Budget::new(BudgetScope::Phase, Some("backend".into()), 1000.0, None);
        store.insert_budget(&global).await.unwrap();
        store.insert_budget(&ticket_budget).await.unwrap();
        store.insert_budget(&phase_budget).await.unwrap();

        engine
            .record_sandbox_cost(task_id, None, "sandbox-1", "anthropic", "claude-opus-4", 10.0)
            .await
            .unwrap();

        let global_after = store
            .list_budgets_for_scope(BudgetScope::Global, None)
            .await
            .unwrap();
        assert_eq!(global_after[0].spent_amount, 10.0);

        let ticket_after = store
            .list_budgets_for_scope(BudgetScope::Ticket, Some(ticket_id.to_string()))
            .await
            .unwrap();
        assert_eq!(ticket_after[0].spent_amount, 10.0);

        let phase_after = store
            .list_budgets_for_scope(BudgetScope::Phase, Some("backend".into()))
            .await
            .unwrap();
        assert_eq!(phase_after[0].spent_amount, 10.0);
    }

    #[tokio::test]
    async fn is_budget_available_true_when_no_budget_exists() {
        let (engine, _store, _ticket_id, _task_id) = harness().await;
        assert!(engine
            .is_budget_available(BudgetScope::Agent, Some(EntityId::new().to_string()), 50.0)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn is_budget_available_false_when_estimate_exceeds_remaining() {
        let (engine, store, ticket_id, _task_id) = harness().await;
        let budget = Budget::new(BudgetScope::Ticket, Some(ticket_id.to_string()), 100.0, None);
        store.insert_budget(&budget).await.unwrap();
        assert!(!engine
            .is_budget_available(BudgetScope::Ticket, Some(ticket_id.to_string()), 150.0)
            .await
            .unwrap());
    }
}
