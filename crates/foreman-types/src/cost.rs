//! Cost Record and Budget entities (§4.6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::EntityId;

/// Default fraction of `limit_amount` at which a budget fires
/// `cost.budget.warning`.
pub const DEFAULT_ALERT_THRESHOLD: f64 = 0.8;

/// Split applied to a sandbox-reported `cost_usd` value when no
/// provider/model token breakdown is available (§4.6): 30% attributed to
/// prompt cost, 70% to completion cost. `total_cost` remains authoritative.
pub const SANDBOX_PROMPT_SPLIT: f64 = 0.3;
/// See [`SANDBOX_PROMPT_SPLIT`].
pub const SANDBOX_COMPLETION_SPLIT: f64 = 0.7;

/// An immutable record of a single priced LLM turn or sandbox-reported cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    /// Opaque identifier.
    pub id: EntityId,
    /// The task this cost is attributed to.
    pub task_id: EntityId,
    /// The agent that incurred the cost, if known.
    pub agent_id: Option<EntityId>,
    /// The sandbox that incurred the cost, if known.
    pub sandbox_id: Option<String>,
    /// Billing account, if the deployment tracks one.
    pub billing_account: Option<String>,
    /// LLM provider tag, e.g. `"anthropic"`.
    pub provider: String,
    /// Model tag, e.g. `"claude-opus-4"`.
    pub model: String,
    /// Prompt tokens consumed.
    pub prompt_tokens: u64,
    /// Completion tokens produced.
    pub completion_tokens: u64,
    /// `prompt_tokens + completion_tokens`.
    pub total_tokens: u64,
    /// Cost attributed to the prompt.
    pub prompt_cost: f64,
    /// Cost attributed to the completion.
    pub completion_cost: f64,
    /// `prompt_cost + completion_cost`; authoritative total.
    pub total_cost: f64,
    /// When this record was written. Immutable thereafter.
    pub recorded_at: DateTime<Utc>,
}

impl CostRecord {
    /// Apply `calculate_cost` from §4.6: `(pt*p_rate, ct*c_rate, sum)`.
    #[allow(clippy::too_many_arguments)]
    pub fn from_token_usage(
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
    ) -> Self {
        let prompt_cost = prompt_tokens as f64 * prompt_token_cost;
        let completion_cost = completion_tokens as f64 * completion_token_cost;
        Self {
            id: EntityId::new(),
            task_id,
            agent_id,
            sandbox_id,
            billing_account,
            provider: provider.into(),
            model: model.into(),
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            prompt_cost,
            completion_cost,
            total_cost: prompt_cost + completion_cost,
            recorded_at: Utc::now(),
        }
    }

    /// Build a record from a sandbox-reported `cost_usd` total, applying the
    /// 30/70 prompt/completion split convention. Token counts are unknown
    /// and left at zero.
    pub fn from_sandbox_report(
        task_id: EntityId,
        agent_id: Option<EntityId>,
        sandbox_id: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        cost_usd: f64,
    ) -> Self {
        Self {
            id: EntityId::new(),
            task_id,
            agent_id,
            sandbox_id: Some(sandbox_id.into()),
            billing_account: None,
            provider: provider.into(),
            model: model.into(),
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            prompt_cost: cost_usd * SANDBOX_PROMPT_SPLIT,
            completion_cost: cost_usd * SANDBOX_COMPLETION_SPLIT,
            total_cost: cost_usd,
            recorded_at: Utc::now(),
        }
    }
}

/// What a [`Budget`] aggregates spend over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    /// Aggregates all spend; `scope_id` is always `None`.
    Global,
    /// Aggregates spend for one ticket (and its tasks).
    Ticket,
    /// Aggregates spend for one agent.
    Agent,
    /// Aggregates spend for one phase.
    Phase,
}

/// A spend limit over some [`BudgetScope`], with alert-threshold tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    /// Opaque identifier.
    pub id: EntityId,
    /// What this budget aggregates.
    pub scope_type: BudgetScope,
    /// Id of the scoped entity (an [`EntityId`]'s string form for `Ticket`
    /// and `Agent` scopes, a phase tag for `Phase`); `None` iff
    /// `scope_type == Global`.
    pub scope_id: Option<String>,
    /// Ceiling on spend.
    pub limit_amount: f64,
    /// Cumulative recorded spend.
    pub spent_amount: f64,
    /// Fraction of `limit_amount` (0–1) at which `cost.budget.warning` fires.
    pub alert_threshold: f64,
    /// Whether the alert has already fired this period. Flips false→true at
    /// the earliest update crossing `alert_threshold` and never flips back
    /// within a period.
    pub alert_triggered: bool,
    /// Start of the tracked period.
    pub period_start: DateTime<Utc>,
    /// End of the tracked period; `None` means indefinite.
    pub period_end: Option<DateTime<Utc>>,
}

/// Outcome of applying a spend update to a [`Budget`], telling the caller
/// which events (if any) to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetUpdateOutcome {
    /// `cost.budget.warning` should be emitted for this update.
    pub crossed_alert_threshold: bool,
    /// `cost.budget.exceeded` should be emitted for this update.
    pub exceeded: bool,
}

impl Budget {
    /// Construct a new budget for `scope_type`/`scope_id`, starting now,
    /// with no spend recorded.
    pub fn new(
        scope_type: BudgetScope,
        scope_id: Option<String>,
        limit_amount: f64,
        period_end: Option<DateTime<Utc>>,
    ) -> Self {
        debug_assert!(
            (scope_type == BudgetScope::Global) == scope_id.is_none(),
            "scope_id must be None iff scope is global"
        );
        Self {
            id: EntityId::new(),
            scope_type,
            scope_id,
            limit_amount,
            spent_amount: 0.0,
            alert_threshold: DEFAULT_ALERT_THRESHOLD,
            alert_triggered: false,
            period_start: Utc::now(),
            period_end,
        }
    }

    /// `limit - spent`, clamped at zero — never negative even once
    /// `spent_amount` exceeds `limit_amount`.
    pub fn remaining_amount(&self) -> f64 {
        (self.limit_amount - self.spent_amount).max(0.0)
    }

    /// `(spent + estimated_cost) <= limit`, per `is_budget_available` (§4.6).
    /// Callers treat "no budget for scope" as available at a layer above
    /// this type (this method assumes a budget exists).
    pub fn has_room_for(&self, estimated_cost: f64) -> bool {
        self.spent_amount + estimated_cost <= self.limit_amount
    }

    /// Apply `amount` of new spend, returning which events should fire.
    /// `alert_triggered` flips monotonically within a period: once set, a
    /// later update never re-fires `cost.budget.warning`, but
    /// `cost.budget.exceeded` fires on every crossing update while over
    /// limit.
    pub fn apply_spend(&mut self, amount: f64) -> BudgetUpdateOutcome {
        let was_under_threshold =
            self.spent_amount / self.limit_amount.max(f64::EPSILON) < self.alert_threshold;
        let was_over_limit = self.spent_amount > self.limit_amount;

        self.spent_amount += amount;

        let now_over_threshold =
            self.spent_amount / self.limit_amount.max(f64::EPSILON) >= self.alert_threshold;
        let crossed_alert_threshold =
            was_under_threshold && now_over_threshold && !self.alert_triggered;
        if crossed_alert_threshold {
            self.alert_triggered = true;
        }

        let now_over_limit = self.spent_amount > self.limit_amount;
        let exceeded = now_over_limit && (!was_over_limit || now_over_limit);

        BudgetUpdateOutcome { crossed_alert_threshold, exceeded }
    }
}

/// Forecast buffer multiplier applied on top of the raw projected cost
/// (§4.6).
pub const FORECAST_BUFFER_MULTIPLIER: f64 = 1.2;

/// Forecast `estimated_cost = task_count * cost_per_task * buffer_multiplier`
/// where `cost_per_task` is derived from an assumed 50/50 prompt/completion
/// split of `avg_tokens_per_task`.
pub fn forecast_cost(
    task_count: u64,
    avg_tokens_per_task: u64,
    prompt_token_cost: f64,
    completion_token_cost: f64,
) -> f64 {
    let half = avg_tokens_per_task as f64 / 2.0;
    let cost_per_task = half * prompt_token_cost + half * completion_token_cost;
    task_count as f64 * cost_per_task * FORECAST_BUFFER_MULTIPLIER
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_record_sums_prompt_and_completion() {
        let rec = CostRecord::from_token_usage(
            EntityId::new(),
            None,
            None,
            None,
            "anthropic",
            "claude-opus-4",
            1000,
            500,
            0.000015,
            0.000075,
        );
        assert_eq!(rec.total_tokens, 1500);
        assert!((rec.total_cost - (1000.0 * 0.000015 + 500.0 * 0.000075)).abs() < 1e-12);
    }

    #[test]
    fn sandbox_report_applies_30_70_split() {
        let rec = CostRecord::from_sandbox_report(
            EntityId::new(),
            None,
            "sandbox-1",
            "anthropic",
            "claude-opus-4",
            10.0,
        );
        assert!((rec.prompt_cost - 3.0).abs() < 1e-9);
        assert!((rec.completion_cost - 7.0).abs() < 1e-9);
        assert_eq!(rec.total_cost, 10.0);
    }

    #[test]
    fn remaining_amount_clamps_at_zero() {
        let mut budget = Budget::new(BudgetScope::Global, None, 100.0, None);
        budget.spent_amount = 150.0;
        assert_eq!(budget.remaining_amount(), 0.0);
    }

    #[test]
    fn alert_triggers_once_and_never_reverts_within_period() {
        let mut budget = Budget::new(BudgetScope::Global, None, 100.0, None);
        let first = budget.apply_spend(85.0);
        assert!(first.crossed_alert_threshold);
        assert!(budget.alert_triggered);
        let second = budget.apply_spend(-5.0);
        assert!(!second.crossed_alert_threshold);
        assert!(budget.alert_triggered);
    }

    #[test]
    fn exceeded_fires_on_every_crossing_update_while_over_limit() {
        let mut budget = Budget::new(BudgetScope::Global, None, 100.0, None);
        let first = budget.apply_spend(120.0);
        assert!(first.exceeded);
        let second = budget.apply_spend(10.0);
        assert!(second.exceeded);
    }

    #[test]
    fn has_room_for_matches_is_budget_available() {
        let budget = Budget::new(BudgetScope::Ticket, Some(EntityId::new().to_string()), 100.0, None);
        assert!(budget.has_room_for(100.0));
        assert!(!budget.has_room_for(100.01));
    }

    #[test]
    fn forecast_matches_formula() {
        let estimated = forecast_cost(10, 1000, 0.00001, 0.00002);
        let expected = 10.0 * (500.0 * 0.00001 + 500.0 * 0.00002) * 1.2;
        assert!((estimated - expected).abs() < 1e-9);
    }
}
