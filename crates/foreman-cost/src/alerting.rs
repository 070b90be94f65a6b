//! Threshold-driven alerting: rule evaluation, deduplication, and the
//! acknowledge/resolve lifecycle.
//!
//! A rule's `condition` is a typed comparison rather than the stringly-typed,
//! `eval`-backed expression of the system this was adapted from — `value ><=
//! threshold` is exhaustively enumerable, so there is no reason to carry a
//! runtime expression evaluator for it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use foreman_bus::{EventBus, EventType, SystemEvent};
use foreman_types::EntityId;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// How a rule's `current_value` is compared against its `threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// `value > threshold`.
    GreaterThan,
    /// `value >= threshold`.
    GreaterOrEqual,
    /// `value < threshold`.
    LessThan,
    /// `value <= threshold`.
    LessOrEqual,
    /// `value == threshold`.
    Equal,
    /// `value != threshold`.
    NotEqual,
}

impl Condition {
    fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Condition::GreaterThan => value > threshold,
            Condition::GreaterOrEqual => value >= threshold,
            Condition::LessThan => value < threshold,
            Condition::LessOrEqual => value <= threshold,
            Condition::Equal => (value - threshold).abs() < f64::EPSILON,
            Condition::NotEqual => (value - threshold).abs() >= f64::EPSILON,
        }
    }
}

/// Severity attached to a triggered alert, also used as the default
/// routing hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational; no paging.
    Info,
    /// Needs attention but not urgent.
    Warning,
    /// Needs prompt attention.
    Critical,
}

/// A named threshold check against one metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    /// Stable identifier, distinct from any particular firing.
    pub rule_id: String,
    /// Human-readable name, used in alert messages.
    pub name: String,
    /// The metric this rule watches.
    pub metric_name: String,
    /// The comparison applied to an observed value.
    pub condition: Condition,
    /// The threshold compared against.
    pub threshold: f64,
    /// Severity assigned to alerts this rule triggers.
    pub severity: Severity,
    /// Routing channel tags (e.g. `"email"`, `"slack"`, `"webhook"`);
    /// delivery is a deployment concern outside this crate, so these are
    /// carried through on the alert for a caller to act on.
    pub routing: Vec<String>,
    /// Disabled rules never trigger.
    pub enabled: bool,
    /// Once a rule has triggered, further matches against an unresolved
    /// alert within this window are suppressed.
    pub deduplication_window: std::time::Duration,
}

impl AlertRule {
    /// Construct an enabled rule with a 5 minute deduplication window and
    /// no routing.
    pub fn new(
        rule_id: impl Into<String>,
        name: impl Into<String>,
        metric_name: impl Into<String>,
        condition: Condition,
        threshold: f64,
        severity: Severity,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            name: name.into(),
            metric_name: metric_name.into(),
            condition,
            threshold,
            severity,
            routing: Vec::new(),
            enabled: true,
            deduplication_window: std::time::Duration::from_secs(300),
        }
    }

    /// Whether `metric_name`/`value` trips this rule.
    pub fn evaluate(&self, metric_name: &str, value: f64) -> bool {
        self.enabled && self.metric_name == metric_name && self.condition.holds(value, self.threshold)
    }
}

/// A single triggered alert, tracked through acknowledge/resolve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Opaque identifier.
    pub id: EntityId,
    /// The rule that fired.
    pub rule_id: String,
    /// The metric observed.
    pub metric_name: String,
    /// Severity copied from the rule at trigger time.
    pub severity: Severity,
    /// The value that tripped the rule.
    pub current_value: f64,
    /// The threshold compared against.
    pub threshold: f64,
    /// Rendered human-readable summary.
    pub message: String,
    /// Labels supplied by the caller (e.g. `agent_id`, `phase`).
    pub labels: Json,
    /// When this alert fired.
    pub triggered_at: DateTime<Utc>,
    /// When an operator acknowledged it, if they have.
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// Who acknowledged it.
    pub acknowledged_by: Option<String>,
    /// When it was resolved, if it has been.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it.
    pub resolved_by: Option<String>,
    /// Optional free-text note left at resolution.
    pub resolution_note: Option<String>,
}

impl Alert {
    fn trigger(rule: &AlertRule, metric_name: &str, value: f64, labels: Json) -> Self {
        Self {
            id: EntityId::new(),
            rule_id: rule.rule_id.clone(),
            metric_name: metric_name.to_string(),
            severity: rule.severity,
            current_value: value,
            threshold: rule.threshold,
            message: format!("{}: {} = {} (threshold {})", rule.name, metric_name, value, rule.threshold),
            labels,
            triggered_at: Utc::now(),
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
            resolution_note: None,
        }
    }

    /// An alert is active while unresolved; only active alerts count
    /// towards a rule's deduplication window.
    pub fn is_active(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// Errors raised by [`AlertService`] operations.
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    /// No alert exists with the given id.
    #[error("alert not found: {0}")]
    NotFound(EntityId),
    /// The alert was already resolved or acknowledged.
    #[error("alert {0} already {1}")]
    AlreadyTerminal(EntityId, &'static str),
}

/// Evaluates [`AlertRule`]s against observed metrics, deduplicates firings,
/// and tracks the acknowledge/resolve lifecycle in memory.
///
/// Unlike the YAML-file-backed rule loader this was adapted from, rules are
/// registered programmatically; a caller wiring this service from
/// configuration is responsible for turning config into [`AlertRule`]
/// values.
pub struct AlertService {
    bus: Arc<dyn EventBus>,
    rules: parking_lot::RwLock<Vec<AlertRule>>,
    alerts: parking_lot::RwLock<Vec<Alert>>,
}

impl AlertService {
    /// Construct an alert service with no rules registered yet.
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus, rules: parking_lot::RwLock::new(Vec::new()), alerts: parking_lot::RwLock::new(Vec::new()) }
    }

    /// Register or replace a rule (matched by `rule_id`).
    pub fn add_rule(&self, rule: AlertRule) {
        let mut rules = self.rules.write();
        rules.retain(|r| r.rule_id != rule.rule_id);
        rules.push(rule);
    }

    /// Evaluate every registered rule against `metric_name`/`value`,
    /// skipping rules suppressed by an active duplicate within their
    /// deduplication window. Triggered alerts are recorded and published
    /// as `alert.triggered`.
    pub fn evaluate_rules(&self, metric_name: &str, value: f64, labels: Json) -> Vec<Alert> {
        let rules = self.rules.read().clone();
        let mut triggered = Vec::new();

        for rule in rules.iter().filter(|r| r.evaluate(metric_name, value)) {
            if self.has_recent_duplicate(rule, metric_name) {
                continue;
            }
            let alert = Alert::trigger(rule, metric_name, value, labels.clone());
            self.alerts.write().push(alert.clone());

            let _ = self.bus.publish(&SystemEvent::with_payload(
                EventType::AlertTriggered,
                "alert",
                alert.id,
                serde_json::json!({
                    "rule_id": alert.rule_id,
                    "metric_name": alert.metric_name,
                    "severity": alert.severity,
                    "value": alert.current_value,
                    "labels": alert.labels,
                }),
            ));
            triggered.push(alert);
        }

        triggered
    }

    fn has_recent_duplicate(&self, rule: &AlertRule, metric_name: &str) -> bool {
        let window_start = Utc::now() - Duration::from_std(rule.deduplication_window).unwrap_or(Duration::seconds(300));
        self.alerts
            .read()
            .iter()
            .any(|a| a.rule_id == rule.rule_id && a.metric_name == metric_name && a.is_active() && a.triggered_at >= window_start)
    }

    /// Mark an alert acknowledged, emitting `alert.acknowledged`.
    pub fn acknowledge_alert(&self, alert_id: EntityId, acknowledged_by: impl Into<String>) -> Result<Alert, AlertError> {
        let acknowledged_by = acknowledged_by.into();
        let mut alerts = self.alerts.write();
        let alert = alerts.iter_mut().find(|a| a.id == alert_id).ok_or(AlertError::NotFound(alert_id))?;
        if alert.acknowledged_at.is_some() {
            return Err(AlertError::AlreadyTerminal(alert_id, "acknowledged"));
        }
        alert.acknowledged_at = Some(Utc::now());
        alert.acknowledged_by = Some(acknowledged_by.clone());
        let snapshot = alert.clone();
        drop(alerts);

        let _ = self.bus.publish(&SystemEvent::with_payload(
            EventType::AlertAcknowledged,
            "alert",
            alert_id,
            serde_json::json!({ "acknowledged_by": acknowledged_by }),
        ));
        Ok(snapshot)
    }

    /// Mark an alert resolved, emitting `alert.resolved`.
    pub fn resolve_alert(
        &self,
        alert_id: EntityId,
        resolved_by: impl Into<String>,
        note: Option<String>,
    ) -> Result<Alert, AlertError> {
        let resolved_by = resolved_by.into();
        let mut alerts = self.alerts.write();
        let alert = alerts.iter_mut().find(|a| a.id == alert_id).ok_or(AlertError::NotFound(alert_id))?;
        if alert.resolved_at.is_some() {
            return Err(AlertError::AlreadyTerminal(alert_id, "resolved"));
        }
        alert.resolved_at = Some(Utc::now());
        alert.resolved_by = Some(resolved_by.clone());
        alert.resolution_note = note.clone();
        let snapshot = alert.clone();
        drop(alerts);

        let _ = self.bus.publish(&SystemEvent::with_payload(
            EventType::AlertResolved,
            "alert",
            alert_id,
            serde_json::json!({ "resolved_by": resolved_by, "note": note }),
        ));
        Ok(snapshot)
    }

    /// Every currently-unresolved alert.
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts.read().iter().filter(|a| a.is_active()).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_bus::InMemoryBus;

    fn service() -> AlertService {
        AlertService::new(Arc::new(InMemoryBus::new(64)))
    }

    #[test]
    fn evaluate_rules_triggers_on_crossing_value() {
        let svc = service();
        svc.add_rule(AlertRule::new(
            "queue-depth-high",
            "Queue depth high",
            "queue_depth",
            Condition::GreaterThan,
            100.0,
            Severity::Warning,
        ));

        let none = svc.evaluate_rules("queue_depth", 50.0, Json::Null);
        assert!(none.is_empty());

        let triggered = svc.evaluate_rules("queue_depth", 150.0, Json::Null);
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].metric_name, "queue_depth");
    }

    #[test]
    fn duplicate_within_window_is_suppressed() {
        let svc = service();
        svc.add_rule(AlertRule::new(
            "queue-depth-high",
            "Queue depth high",
            "queue_depth",
            Condition::GreaterThan,
            100.0,
            Severity::Warning,
        ));

        let first = svc.evaluate_rules("queue_depth", 150.0, Json::Null);
        assert_eq!(first.len(), 1);
        let second = svc.evaluate_rules("queue_depth", 200.0, Json::Null);
        assert!(second.is_empty(), "duplicate within the dedup window must be suppressed");
    }

    #[test]
    fn resolved_duplicate_no_longer_suppresses() {
        let svc = service();
        svc.add_rule(AlertRule::new(
            "queue-depth-high",
            "Queue depth high",
            "queue_depth",
            Condition::GreaterThan,
            100.0,
            Severity::Warning,
        ));

        let first = svc.evaluate_rules("queue_depth", 150.0, Json::Null).remove(0);
        svc.resolve_alert(first.id, "operator-1", None).unwrap();

        let second = svc.evaluate_rules("queue_depth", 200.0, Json::Null);
        assert_eq!(second.len(), 1, "a resolved alert must not suppress a fresh firing");
    }

    #[test]
    fn acknowledge_then_resolve_lifecycle() {
        let svc = service();
        svc.add_rule(AlertRule::new(
            "cost-spike",
            "Cost spike",
            "hourly_cost",
            Condition::GreaterOrEqual,
            10.0,
            Severity::Critical,
        ));

        let alert = svc.evaluate_rules("hourly_cost", 12.0, Json::Null).remove(0);
        assert_eq!(svc.active_alerts().len(), 1);

        let acked = svc.acknowledge_alert(alert.id, "operator-1").unwrap();
        assert!(acked.acknowledged_at.is_some());
        assert!(svc.acknowledge_alert(alert.id, "operator-2").is_err());

        let resolved = svc.resolve_alert(alert.id, "operator-1", Some("scaled down".into())).unwrap();
        assert!(resolved.resolved_at.is_some());
        assert_eq!(svc.active_alerts().len(), 0);
    }

    #[test]
    fn disabled_rule_never_triggers() {
        let svc = service();
        let mut rule = AlertRule::new(
            "queue-depth-high",
            "Queue depth high",
            "queue_depth",
            Condition::GreaterThan,
            100.0,
            Severity::Warning,
        );
        rule.enabled = false;
        svc.add_rule(rule);

        assert!(svc.evaluate_rules("queue_depth", 500.0, Json::Null).is_empty());
    }
}
