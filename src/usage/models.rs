//! Data models for agent session logs and usage aggregation

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One line of a session log, as it appears on disk.
///
/// Every field is optional so that deserialization only fails on lines that
/// are not JSON objects at all.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawLogLine {
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub message: Option<RawMessage>,
    pub timestamp: Option<serde_json::Value>,
    pub provider: Option<String>,
    #[serde(rename = "modelId")]
    pub model_id: Option<String>,
    #[serde(rename = "customType")]
    pub custom_type: Option<String>,
    pub data: Option<RawSnapshot>,
    pub version: Option<String>,
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMessage {
    pub role: Option<String>,
    pub content: Option<serde_json::Value>,
    pub provider: Option<String>,
    pub model: Option<String>,
}

/// Payload of a `custom` / `model-snapshot` line
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSnapshot {
    pub provider: Option<String>,
    #[serde(rename = "modelId")]
    pub model_id: Option<String>,
}

/// Speaker of a transcript message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// A typed session event
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Message {
        role: Role,
        content: String,
        provider: Option<String>,
        model: Option<String>,
        timestamp: Option<DateTime<Utc>>,
    },
    ModelChange {
        provider: String,
        model_id: String,
        timestamp: Option<DateTime<Utc>>,
    },
    ModelSnapshot {
        provider: Option<String>,
        model_id: Option<String>,
        timestamp: Option<DateTime<Utc>>,
    },
    SessionStart {
        version: Option<String>,
        cwd: Option<String>,
        timestamp: Option<DateTime<Utc>>,
    },
    /// Valid JSON with a shape we do not interpret
    Unknown {
        raw: String,
        timestamp: Option<DateTime<Utc>>,
    },
}

impl Event {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Event::Message { timestamp, .. }
            | Event::ModelChange { timestamp, .. }
            | Event::ModelSnapshot { timestamp, .. }
            | Event::SessionStart { timestamp, .. }
            | Event::Unknown { timestamp, .. } => *timestamp,
        }
    }

    pub fn is_assistant_message(&self) -> bool {
        matches!(self, Event::Message { role: Role::Assistant, .. })
    }
}

/// A `(provider, modelId)` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRef {
    pub provider: String,
    pub model_id: String,
}

impl ModelRef {
    pub fn new(provider: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model_id: model_id.into(),
        }
    }

    pub fn unknown() -> Self {
        Self::new("unknown", "unknown")
    }

    /// Parse a `provider/model` string. Everything after the first slash is the
    /// model id; a string without a slash is attributed to an unknown provider.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() || value == "N/A" {
            return None;
        }
        match value.split_once('/') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
                Some(Self::new(provider, model))
            }
            _ => Some(Self::new("unknown", value)),
        }
    }

    /// Grouping key used in the usage snapshot, `provider/modelId`
    pub fn key(&self) -> String {
        format!("{}/{}", self.provider, self.model_id)
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model_id)
    }
}

/// Agent as declared in the registry or discovered on disk
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub emoji: String,
    pub role: String,
    pub default_model: Option<String>,
    pub workspace: Option<String>,
    #[serde(rename = "subagents")]
    pub subagent_ids: Vec<String>,
    /// Found only by directory scan, absent from the registry config
    pub discovered: bool,
}

/// Liveness of an agent derived from its session directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Idle,
    Unknown,
}

/// Agent plus its on-disk status, as served by the agent list
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    #[serde(flatten)]
    pub agent: Agent,
    /// Model seen most recently in the newest session, else the default
    pub model: Option<String>,
    pub status: AgentStatus,
    pub session_count: u32,
    pub last_activity: Option<String>,
}

/// Call count for one model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsage {
    pub provider: String,
    pub model_id: String,
    pub model_name: String,
    pub count: u64,
}

/// Per-model call counts for one agent
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentUsage {
    pub agent_id: String,
    pub agent_name: String,
    pub agent_emoji: String,
    pub models: BTreeMap<String, u64>,
    pub total: u64,
}

/// Per-model call counts for one UTC day
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DayUsage {
    pub date: String,
    pub counts: BTreeMap<String, u64>,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub total_calls: u64,
    pub total_models: u32,
    pub total_agents: u32,
    pub date_range: String,
    pub days: u32,
}

/// Complete model usage snapshot
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub by_model: Vec<ModelUsage>,
    pub by_agent: Vec<AgentUsage>,
    pub by_day: Vec<DayUsage>,
    pub summary: UsageSummary,
}

/// Date range placeholder when no calls were counted
pub const NO_DATE_RANGE: &str = "N/A";

/// Date bucket for assistant turns without a timestamp
pub const UNKNOWN_DATE: &str = "unknown";

impl UsageSnapshot {
    pub fn empty(days: u32) -> Self {
        Self {
            by_model: Vec::new(),
            by_agent: Vec::new(),
            by_day: Vec::new(),
            summary: UsageSummary {
                total_calls: 0,
                total_models: 0,
                total_agents: 0,
                date_range: NO_DATE_RANGE.to_string(),
                days,
            },
        }
    }
}

/// Gateway resource sample
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub cpu: f64,
    /// Resident memory in MB
    #[serde(default)]
    pub memory: f64,
    #[serde(default)]
    pub gateway_status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub score: u32,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Task durations observed in one sampling pass, in seconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatsRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub execution_times: Vec<f64>,
    #[serde(default)]
    pub count: usize,
}

/// Model usage snapshot keyed by `provider:modelId`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatsRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub usage: BTreeMap<String, ModelUsage>,
}

impl ModelStatsRecord {
    pub fn from_snapshot(timestamp: DateTime<Utc>, snapshot: &UsageSnapshot) -> Self {
        let usage = snapshot
            .by_model
            .iter()
            .map(|m| (format!("{}:{}", m.provider, m.model_id), m.clone()))
            .collect();
        Self { timestamp, usage }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_ref_parse() {
        assert_eq!(
            ModelRef::parse("openai/gpt-4"),
            Some(ModelRef::new("openai", "gpt-4"))
        );
        // Model ids may themselves contain slashes
        assert_eq!(
            ModelRef::parse("openrouter/meta/llama-3"),
            Some(ModelRef::new("openrouter", "meta/llama-3"))
        );
        assert_eq!(
            ModelRef::parse("gpt-4"),
            Some(ModelRef::new("unknown", "gpt-4"))
        );
        assert_eq!(ModelRef::parse("N/A"), None);
        assert_eq!(ModelRef::parse("  "), None);
    }

    #[test]
    fn test_agent_info_serializes_flat() {
        let info = AgentInfo {
            agent: Agent {
                id: "main".to_string(),
                name: "Main".to_string(),
                subagent_ids: vec!["coder".to_string()],
                ..Default::default()
            },
            model: None,
            status: AgentStatus::Idle,
            session_count: 0,
            last_activity: None,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["id"], "main");
        assert_eq!(json["subagents"][0], "coder");
        assert_eq!(json["status"], "idle");
        assert_eq!(json["sessionCount"], 0);
    }
}
