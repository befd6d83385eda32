//! Threshold alerting over the latest metrics

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

pub const ALERT_RULES_FILE: &str = "alert-rules.json";
pub const ALERTS_HISTORY_FILE: &str = "alerts-history.json";

/// Alerts kept in history
pub const MAX_ALERT_HISTORY: usize = 1000;

/// Error type for alert persistence
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Metric a rule watches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Cpu,
    Memory,
    Health,
    ErrorRate,
}

impl MetricType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cpu" => Some(MetricType::Cpu),
            "memory" => Some(MetricType::Memory),
            "health" => Some(MetricType::Health),
            "error_rate" => Some(MetricType::ErrorRate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
}

impl Comparison {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            ">" => Some(Comparison::Gt),
            ">=" => Some(Comparison::Ge),
            "<" => Some(Comparison::Lt),
            "<=" => Some(Comparison::Le),
            "==" => Some(Comparison::Eq),
            _ => None,
        }
    }

    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Gt => value > threshold,
            Comparison::Ge => value >= threshold,
            Comparison::Lt => value < threshold,
            Comparison::Le => value <= threshold,
            Comparison::Eq => value == threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Critical,
}

fn default_enabled() -> bool {
    true
}

/// A threshold rule. Metric type and operator are kept as written so that
/// rules the dashboard does not understand survive a save; they never fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub metric: String,
    pub threshold: f64,
    pub operator: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub severity: Severity,
    /// Seconds; informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<u64>,
}

impl AlertRule {
    pub fn new(
        id: &str,
        name: &str,
        metric: &str,
        operator: &str,
        threshold: f64,
        severity: Severity,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            metric: metric.to_string(),
            threshold,
            operator: operator.to_string(),
            enabled: true,
            severity,
            time_window: None,
        }
    }

    pub fn metric_type(&self) -> Option<MetricType> {
        MetricType::parse(&self.metric)
    }

    pub fn comparison(&self) -> Option<Comparison> {
        Comparison::parse(&self.operator)
    }

    /// Whether the rule's condition holds for these metrics
    pub fn is_triggered(&self, metrics: &MetricsSnapshot) -> bool {
        match (self.metric_type(), self.comparison()) {
            (Some(metric), Some(op)) => op.holds(metrics.value(metric), self.threshold),
            _ => false,
        }
    }

    fn message(&self, metrics: &MetricsSnapshot) -> String {
        let Some(metric) = self.metric_type() else {
            return format!("{} triggered", self.name);
        };
        let value = metrics.value(metric);
        match metric {
            MetricType::Cpu => format!(
                "CPU usage {:.1}% {} threshold {}%",
                value, self.operator, self.threshold
            ),
            MetricType::Memory => format!(
                "Memory usage {:.1}% {} threshold {}%",
                value, self.operator, self.threshold
            ),
            MetricType::Health => format!(
                "Health score {} {} threshold {}",
                value, self.operator, self.threshold
            ),
            MetricType::ErrorRate => format!(
                "Error rate {:.1}% {} threshold {}%",
                value, self.operator, self.threshold
            ),
        }
    }
}

/// Rules installed when none are persisted
pub fn default_rules() -> Vec<AlertRule> {
    let mut error_rate = AlertRule::new(
        "error-rate-high",
        "High error rate",
        "error_rate",
        ">",
        10.0,
        Severity::Warning,
    );
    error_rate.time_window = Some(300);

    vec![
        AlertRule::new("cpu-high", "High CPU usage", "cpu", ">", 80.0, Severity::Warning),
        AlertRule::new("memory-high", "High memory usage", "memory", ">", 85.0, Severity::Warning),
        AlertRule::new("health-low", "Low system health", "health", "<", 50.0, Severity::Critical),
        error_rate,
    ]
}

/// Latest values the rules are evaluated against
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub memory: Option<f64>,
    #[serde(default)]
    pub health_score: Option<f64>,
    #[serde(default)]
    pub error_rate: Option<f64>,
}

impl MetricsSnapshot {
    /// Missing values read as 0, except health which reads as a perfect 100
    pub fn value(&self, metric: MetricType) -> f64 {
        match metric {
            MetricType::Cpu => self.cpu.unwrap_or(0.0),
            MetricType::Memory => self.memory.unwrap_or(0.0),
            MetricType::Health => self.health_score.unwrap_or(100.0),
            MetricType::ErrorRate => self.error_rate.unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub metrics: MetricsSnapshot,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Result of one evaluation cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlertOutcome {
    pub new: Vec<Alert>,
    pub resolved: Vec<Alert>,
    pub active: Vec<Alert>,
}

impl AlertOutcome {
    pub fn changed(&self) -> bool {
        !self.new.is_empty() || !self.resolved.is_empty()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryFile {
    #[serde(default)]
    alerts: Vec<Alert>,
    #[serde(default)]
    last_update: Option<DateTime<Utc>>,
}

/// Tracks active alerts per rule id and keeps the alert history.
///
/// At most one alert is active per rule. A rule fires once when its
/// condition becomes true and resolves on the first cycle it is false.
#[derive(Debug, Default)]
pub struct AlertEvaluator {
    rules: Vec<AlertRule>,
    active: BTreeMap<String, Alert>,
    history: Vec<Alert>,
    data_dir: Option<PathBuf>,
}

impl AlertEvaluator {
    /// In-memory evaluator with the given rules
    pub fn new(rules: Vec<AlertRule>) -> Self {
        Self {
            rules,
            ..Default::default()
        }
    }

    /// Load rules and history from `data_dir`. Missing rules are replaced by
    /// the defaults, which are written back.
    pub fn load(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();

        let rules = match fs::read_to_string(data_dir.join(ALERT_RULES_FILE)) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(rules) => Some(rules),
                Err(e) => {
                    warn!("Malformed alert rules, using defaults: {}", e);
                    None
                }
            },
            Err(_) => None,
        };

        let history = fs::read_to_string(data_dir.join(ALERTS_HISTORY_FILE))
            .ok()
            .and_then(|c| serde_json::from_str::<HistoryFile>(&c).ok())
            .map(|h| h.alerts)
            .unwrap_or_default();

        let mut evaluator = Self {
            rules: Vec::new(),
            active: BTreeMap::new(),
            history,
            data_dir: Some(data_dir),
        };

        match rules {
            Some(rules) => evaluator.rules = rules,
            None => {
                if let Err(e) = evaluator.set_rules(default_rules()) {
                    warn!("Failed to save default alert rules: {}", e);
                }
            }
        }

        evaluator
    }

    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }

    /// Replace the rule set and persist it
    pub fn set_rules(&mut self, rules: Vec<AlertRule>) -> Result<(), AlertError> {
        self.rules = rules;
        if let Some(dir) = &self.data_dir {
            fs::create_dir_all(dir)?;
            fs::write(
                dir.join(ALERT_RULES_FILE),
                serde_json::to_vec_pretty(&self.rules)?,
            )?;
        }
        Ok(())
    }

    /// Evaluate `rules` against `metrics`, updating active alerts and history.
    /// Disabled rules are skipped and keep whatever state they had.
    pub fn evaluate(
        &mut self,
        rules: &[AlertRule],
        metrics: &MetricsSnapshot,
        now: DateTime<Utc>,
    ) -> AlertOutcome {
        let mut outcome = AlertOutcome::default();

        for rule in rules.iter().filter(|r| r.enabled) {
            let triggered = rule.is_triggered(metrics);

            if triggered && !self.active.contains_key(&rule.id) {
                let alert = Alert {
                    id: format!("{}-{}", rule.id, now.timestamp_millis()),
                    rule_id: rule.id.clone(),
                    rule_name: rule.name.clone(),
                    severity: rule.severity,
                    message: rule.message(metrics),
                    timestamp: now,
                    metrics: metrics.clone(),
                    resolved: false,
                    resolved_at: None,
                };
                info!("Alert fired: {}", alert.message);
                self.active.insert(rule.id.clone(), alert.clone());
                self.history.push(alert.clone());
                outcome.new.push(alert);
            } else if !triggered {
                if let Some(mut alert) = self.active.remove(&rule.id) {
                    alert.resolved = true;
                    alert.resolved_at = Some(now);
                    info!("Alert resolved: {}", alert.rule_name);
                    if let Some(entry) = self.history.iter_mut().rev().find(|a| a.id == alert.id) {
                        *entry = alert.clone();
                    }
                    outcome.resolved.push(alert);
                }
            }
        }

        if self.history.len() > MAX_ALERT_HISTORY {
            let excess = self.history.len() - MAX_ALERT_HISTORY;
            self.history.drain(..excess);
        }

        outcome.active = self.active.values().cloned().collect();
        outcome
    }

    /// Evaluate the evaluator's own rules and persist history if anything changed
    pub fn check(&mut self, metrics: &MetricsSnapshot) -> AlertOutcome {
        let rules = self.rules.clone();
        let outcome = self.evaluate(&rules, metrics, Utc::now());
        if outcome.changed() {
            if let Err(e) = self.save_history() {
                warn!("Failed to save alert history: {}", e);
            }
        }
        outcome
    }

    fn save_history(&self) -> Result<(), AlertError> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        fs::create_dir_all(dir)?;
        let file = HistoryFile {
            alerts: self.history.clone(),
            last_update: Some(Utc::now()),
        };
        fs::write(dir.join(ALERTS_HISTORY_FILE), serde_json::to_vec_pretty(&file)?)?;
        Ok(())
    }

    /// Newest first
    pub fn history(&self, limit: usize) -> Vec<Alert> {
        self.history.iter().rev().take(limit).cloned().collect()
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.active.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn cpu(value: f64) -> MetricsSnapshot {
        MetricsSnapshot {
            cpu: Some(value),
            ..Default::default()
        }
    }

    #[test]
    fn test_alert_lifecycle() {
        let rules = vec![AlertRule::new("cpu-high", "CPU", "cpu", ">", 80.0, Severity::Warning)];
        let mut evaluator = AlertEvaluator::new(rules.clone());
        let t0 = Utc::now();

        let first = evaluator.evaluate(&rules, &cpu(85.0), t0);
        assert_eq!(first.new.len(), 1);
        assert!(first.resolved.is_empty());
        assert_eq!(first.active.len(), 1);

        let second = evaluator.evaluate(&rules, &cpu(85.0), t0 + Duration::seconds(5));
        assert!(second.new.is_empty());
        assert_eq!(second.active.len(), 1);

        let third = evaluator.evaluate(&rules, &cpu(50.0), t0 + Duration::seconds(10));
        assert!(third.new.is_empty());
        assert_eq!(third.resolved.len(), 1);
        assert!(third.active.is_empty());

        let resolved = &third.resolved[0];
        assert!(resolved.resolved);
        assert_eq!(resolved.resolved_at, Some(t0 + Duration::seconds(10)));
        assert_eq!(resolved.id, first.new[0].id);

        // History holds one alert, now marked resolved
        let history = evaluator.history(10);
        assert_eq!(history.len(), 1);
        assert!(history[0].resolved);
    }

    #[test]
    fn test_refires_after_resolution() {
        let rules = vec![AlertRule::new("cpu-high", "CPU", "cpu", ">", 80.0, Severity::Warning)];
        let mut evaluator = AlertEvaluator::new(rules.clone());
        let t0 = Utc::now();
        evaluator.evaluate(&rules, &cpu(90.0), t0);
        evaluator.evaluate(&rules, &cpu(10.0), t0 + Duration::seconds(1));
        let again = evaluator.evaluate(&rules, &cpu(90.0), t0 + Duration::seconds(2));
        assert_eq!(again.new.len(), 1);
        assert_eq!(evaluator.history(10).len(), 2);
    }

    #[test]
    fn test_operators_and_unknown_rules() {
        let metrics = MetricsSnapshot {
            cpu: Some(50.0),
            memory: None,
            health_score: None,
            error_rate: Some(10.0),
        };
        let rule = |metric: &str, op: &str, threshold: f64| {
            AlertRule::new("r", "r", metric, op, threshold, Severity::Info)
        };

        assert!(rule("cpu", ">=", 50.0).is_triggered(&metrics));
        assert!(!rule("cpu", ">", 50.0).is_triggered(&metrics));
        assert!(rule("error_rate", "==", 10.0).is_triggered(&metrics));
        assert!(rule("memory", "<=", 0.0).is_triggered(&metrics));
        // Missing health reads as 100
        assert!(!rule("health", "<", 50.0).is_triggered(&metrics));
        assert!(!rule("disk", ">", 0.0).is_triggered(&metrics));
        assert!(!rule("cpu", "!=", 0.0).is_triggered(&metrics));
    }

    #[test]
    fn test_disabled_rules_are_skipped() {
        let mut rule = AlertRule::new("cpu-high", "CPU", "cpu", ">", 80.0, Severity::Warning);
        rule.enabled = false;
        let rules = vec![rule];
        let mut evaluator = AlertEvaluator::new(rules.clone());
        let outcome = evaluator.evaluate(&rules, &cpu(99.0), Utc::now());
        assert_eq!(outcome, AlertOutcome::default());
    }

    #[test]
    fn test_load_installs_default_rules() {
        let tmp = TempDir::new().unwrap();
        let evaluator = AlertEvaluator::load(tmp.path());
        assert_eq!(evaluator.rules().len(), 4);
        assert!(tmp.path().join(ALERT_RULES_FILE).exists());

        let reloaded = AlertEvaluator::load(tmp.path());
        assert_eq!(reloaded.rules(), default_rules().as_slice());
        assert_eq!(reloaded.rules()[3].time_window, Some(300));
    }

    #[test]
    fn test_check_persists_history() {
        let tmp = TempDir::new().unwrap();
        let mut evaluator = AlertEvaluator::load(tmp.path());
        let outcome = evaluator.check(&MetricsSnapshot {
            health_score: Some(20.0),
            ..Default::default()
        });
        assert_eq!(outcome.new.len(), 1);
        assert_eq!(outcome.new[0].severity, Severity::Critical);

        let reloaded = AlertEvaluator::load(tmp.path());
        assert_eq!(reloaded.history(100).len(), 1);
        // Active state is not persisted
        assert!(reloaded.active_alerts().is_empty());
    }

    #[test]
    fn test_rule_json_shape() {
        let rule: AlertRule = serde_json::from_str(
            r#"{"id":"x","name":"X","type":"error_rate","threshold":5,"operator":">"}"#,
        )
        .unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.severity, Severity::Warning);
        assert_eq!(rule.metric_type(), Some(MetricType::ErrorRate));

        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["type"], "error_rate");
        assert!(json.get("timeWindow").is_none());
    }
}
