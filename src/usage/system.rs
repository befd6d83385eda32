//! Host and gateway probes, channel status and the health score

use std::fs;

use serde::Serialize;
use tokio::process::Command;

use crate::usage::alerts::MetricsSnapshot;
use crate::usage::config::{RuntimeConfig, RuntimePaths};
use crate::usage::logs::{error_rate, LogEntry, LogLevel};
use crate::usage::models::{AgentInfo, AgentStatus};
use crate::usage::reader::read_tail_lines;

/// Process name of the runtime gateway
pub const GATEWAY_PROCESS: &str = "openclaw-gateway";

/// Gateway port when the registry does not name one
pub const DEFAULT_GATEWAY_PORT: u16 = 18789;

/// Log lines inspected for channel activity and health
pub const HEALTH_LOG_LINES: usize = 100;

static_regex!(channel_ts_re, r"(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2})");

/// One row of `ps aux`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub pid: String,
    pub cpu: f64,
    pub memory_kb: u64,
    pub command: String,
}

impl ProcessInfo {
    pub fn memory_mb(&self) -> f64 {
        self.memory_kb as f64 / 1024.0
    }
}

/// Parse a `ps aux` line: USER PID %CPU %MEM VSZ RSS TTY STAT START TIME COMMAND...
pub fn parse_ps_line(line: &str) -> Option<ProcessInfo> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 11 {
        return None;
    }
    Some(ProcessInfo {
        pid: parts[1].to_string(),
        cpu: parts[2].parse().unwrap_or(0.0),
        memory_kb: parts[5].parse().unwrap_or(0),
        command: parts[10..].join(" "),
    })
}

/// First process whose `ps aux` line mentions `name`
pub async fn process_info(name: &str) -> Option<ProcessInfo> {
    let output = match Command::new("ps").arg("aux").output().await {
        Ok(o) => o,
        Err(e) => {
            log::debug!("ps aux failed: {}", e);
            return None;
        }
    };
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .skip(1)
        .filter(|l| l.contains(name) && !l.contains("grep"))
        .find_map(parse_ps_line)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayInfo {
    pub port: u16,
    pub status: GatewayStatus,
    pub pid: Option<String>,
    pub cpu: String,
    pub memory: String,
    pub uptime: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemOverview {
    pub hostname: String,
    pub platform: String,
    pub arch: String,
    pub version: String,
    pub gateway: GatewayInfo,
    pub config_loaded: bool,
}

fn hostname() -> String {
    fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "N/A".to_string())
}

/// Host uptime in seconds, where the platform exposes it
fn host_uptime_secs() -> Option<u64> {
    let content = fs::read_to_string("/proc/uptime").ok()?;
    let secs: f64 = content.split_whitespace().next()?.parse().ok()?;
    Some(secs as u64)
}

pub fn format_uptime(secs: u64) -> String {
    format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
}

pub fn system_overview(config: Option<&RuntimeConfig>, gateway: Option<&ProcessInfo>) -> SystemOverview {
    let port = config
        .and_then(|c| c.gateway.port)
        .unwrap_or(DEFAULT_GATEWAY_PORT);

    let gateway = match gateway {
        Some(info) => GatewayInfo {
            port,
            status: GatewayStatus::Running,
            pid: Some(info.pid.clone()),
            cpu: format!("{}%", info.cpu),
            memory: format!("{} KB", info.memory_kb),
            uptime: host_uptime_secs()
                .map(format_uptime)
                .unwrap_or_else(|| "N/A".to_string()),
        },
        None => GatewayInfo {
            port,
            status: GatewayStatus::Stopped,
            pid: None,
            cpu: "0%".to_string(),
            memory: "0 KB".to_string(),
            uptime: "N/A".to_string(),
        },
    };

    SystemOverview {
        hostname: hostname(),
        platform: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        gateway,
        config_loaded: config.is_some(),
    }
}

/// Used memory share from `/proc/meminfo` content
pub fn parse_meminfo(content: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        content
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:").or_else(|| field("MemFree:"))?;
    if total <= 0.0 {
        return None;
    }
    Some((1.0 - available / total) * 100.0)
}

/// Host memory in use, percent. 0 when unavailable.
pub fn host_memory_percent() -> f64 {
    fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|c| parse_meminfo(&c))
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Normal,
    Warning,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub name: String,
    pub enabled: bool,
    pub status: ChannelState,
    pub last_message: Option<String>,
    pub message_count: u64,
}

/// Activity of one channel in recent log lines tagged `[name]`
pub fn channel_activity(lines: &[String], name: &str) -> (bool, Option<String>, u64) {
    let tag = format!("[{}]", name);
    let mut healthy = true;
    let mut last_message = None;
    let mut count = 0;

    for line in lines.iter().filter(|l| l.contains(&tag)) {
        count += 1;
        if let Some(m) = channel_ts_re().captures(line).and_then(|c| c.get(1)) {
            last_message = Some(m.as_str().to_string());
        }
        let lower = line.to_lowercase();
        if lower.contains("error") || lower.contains("failed") {
            healthy = false;
        }
    }

    (healthy, last_message, count)
}

/// Status of each configured channel
pub fn channels_status(paths: &RuntimePaths, config: Option<&RuntimeConfig>) -> Vec<ChannelStatus> {
    let Some(config) = config else {
        return Vec::new();
    };
    if config.channels.is_empty() {
        return Vec::new();
    }

    let lines = read_tail_lines(&paths.gateway_log(), HEALTH_LOG_LINES).unwrap_or_default();

    config
        .channels
        .iter()
        .map(|(name, channel)| {
            let enabled = channel.is_enabled();
            let (healthy, last_message, message_count) = channel_activity(&lines, name);
            ChannelStatus {
                name: name.clone(),
                enabled,
                status: match (enabled, healthy) {
                    (false, _) => ChannelState::Disabled,
                    (true, true) => ChannelState::Normal,
                    (true, false) => ChannelState::Warning,
                },
                last_message,
                message_count,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Warning,
    Critical,
}

impl HealthState {
    pub fn from_score(score: u32) -> Self {
        if score < 50 {
            HealthState::Critical
        } else if score < 80 {
            HealthState::Warning
        } else {
            HealthState::Healthy
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Warning => "warning",
            HealthState::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthIssue {
    #[serde(rename = "type")]
    pub severity: HealthState,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub score: u32,
    pub status: HealthState,
    pub issues: Vec<HealthIssue>,
}

/// Score the runtime from 100 down
pub fn health_status(
    gateway_running: bool,
    channels: &[ChannelStatus],
    logs: &[LogEntry],
    agents: &[AgentInfo],
) -> HealthStatus {
    let mut score: i64 = 100;
    let mut issues = Vec::new();

    if !gateway_running {
        score -= 30;
        issues.push(HealthIssue {
            severity: HealthState::Critical,
            message: "Gateway process is not running".to_string(),
        });
    }

    let failing = channels
        .iter()
        .filter(|c| c.enabled && c.status == ChannelState::Warning)
        .count();
    if failing > 0 {
        score -= 10 * failing as i64;
        issues.push(HealthIssue {
            severity: HealthState::Warning,
            message: format!("{} channel(s) reporting errors", failing),
        });
    }

    let errors = logs.iter().filter(|l| l.level == LogLevel::Error).count();
    if errors > 10 {
        score -= 20;
        issues.push(HealthIssue {
            severity: HealthState::Warning,
            message: format!("{} recent error log lines", errors),
        });
    }

    let unknown = agents.iter().filter(|a| a.status == AgentStatus::Unknown).count();
    score -= 5 * unknown as i64;

    let score = score.max(0) as u32;
    HealthStatus {
        score,
        status: HealthState::from_score(score),
        issues,
    }
}

/// Alert input from the latest probes
pub fn current_metrics(
    gateway: Option<&ProcessInfo>,
    memory_percent: f64,
    health: &HealthStatus,
    logs: &[LogEntry],
) -> MetricsSnapshot {
    MetricsSnapshot {
        cpu: Some(gateway.map(|g| g.cpu).unwrap_or(0.0)),
        memory: Some(memory_percent),
        health_score: Some(f64::from(health.score)),
        error_rate: Some(error_rate(logs)),
    }
}
