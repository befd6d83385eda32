//! Configuration and data directory discovery

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Registry file name inside the runtime home
pub const RUNTIME_CONFIG_FILE: &str = "openclaw.json";

/// Marker in a session file name that flags it as soft-deleted
pub const DELETED_MARKER: &str = ".deleted.";

/// Extension of session log files
pub const SESSION_EXTENSION: &str = ".jsonl";

/// Get the agent runtime home directory
/// Priority: 1. Custom path, 2. AGENT_RUNTIME_HOME env var, 3. Default ~/.openclaw
pub fn get_runtime_home(custom_path: Option<&str>) -> PathBuf {
    if let Some(path) = custom_path {
        return PathBuf::from(path);
    }

    if let Ok(env_path) = env::var("AGENT_RUNTIME_HOME") {
        return PathBuf::from(env_path);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".openclaw");
    }

    // Fallback for edge cases
    PathBuf::from(".openclaw")
}

/// Get the directory where the dashboard keeps its own history files
/// Priority: 1. Custom path, 2. DASHBOARD_DATA_DIR env var, 3. Local data dir
pub fn get_dashboard_data_dir(custom_path: Option<&str>) -> PathBuf {
    if let Some(path) = custom_path {
        return PathBuf::from(path);
    }

    if let Ok(env_path) = env::var("DASHBOARD_DATA_DIR") {
        return PathBuf::from(env_path);
    }

    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agent-dashboard")
}

/// Locations inside the agent runtime home
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    home: PathBuf,
}

impl RuntimePaths {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn config_file(&self) -> PathBuf {
        self.home.join(RUNTIME_CONFIG_FILE)
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.home.join("agents")
    }

    pub fn sessions_dir(&self, agent_id: &str) -> PathBuf {
        self.agents_dir().join(agent_id).join("sessions")
    }

    pub fn session_file(&self, agent_id: &str, session_id: &str) -> PathBuf {
        self.sessions_dir(agent_id)
            .join(format!("{}{}", session_id, SESSION_EXTENSION))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    /// Runtime error log used for log tails, channel checks and health
    pub fn gateway_log(&self) -> PathBuf {
        self.logs_dir().join("gateway.err.log")
    }
}

/// Dashboard settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub runtime_home: Option<String>,
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_history_interval")]
    pub history_interval_secs: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_usage_cache_ttl")]
    pub usage_cache_ttl_secs: u64,
    #[serde(default = "default_scan_cache_ttl")]
    pub scan_cache_ttl_ms: u64,
    #[serde(default = "default_lookback_days")]
    pub usage_lookback_days: u32,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_refresh_interval() -> u64 {
    5
}

fn default_history_interval() -> u64 {
    5
}

fn default_retention_days() -> u32 {
    30
}

fn default_usage_cache_ttl() -> u64 {
    60
}

fn default_scan_cache_ttl() -> u64 {
    2000
}

fn default_lookback_days() -> u32 {
    30
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            runtime_home: None,
            data_dir: None,
            refresh_interval_secs: default_refresh_interval(),
            history_interval_secs: default_history_interval(),
            retention_days: default_retention_days(),
            usage_cache_ttl_secs: default_usage_cache_ttl(),
            scan_cache_ttl_ms: default_scan_cache_ttl(),
            usage_lookback_days: default_lookback_days(),
        }
    }
}

impl DashboardConfig {
    /// Load `dashboard.json` from the data dir (if any), then apply env overrides
    pub fn load() -> Self {
        let data_dir = get_dashboard_data_dir(None);
        let mut config = Self::from_file(&data_dir.join("dashboard.json")).unwrap_or_default();
        config.apply_env();
        config
    }

    fn from_file(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                log::warn!("Ignoring malformed dashboard config {:?}: {}", path, e);
                None
            }
        }
    }

    fn apply_env(&mut self) {
        if let Some(port) = env::var("PORT").ok().and_then(|s| s.parse().ok()) {
            self.port = port;
        }
        if let Ok(host) = env::var("HOST") {
            self.host = host;
        }
    }

    pub fn runtime_paths(&self) -> RuntimePaths {
        RuntimePaths::new(get_runtime_home(self.runtime_home.as_deref()))
    }

    pub fn data_dir(&self) -> PathBuf {
        get_dashboard_data_dir(self.data_dir.as_deref())
    }
}

/// The runtime's registry file. Only the fields the dashboard reads are modelled.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub agents: AgentsSection,
    pub models: ModelsSection,
    pub channels: BTreeMap<String, ChannelConfig>,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentsSection {
    pub list: Vec<AgentConfig>,
    pub defaults: AgentConfig,
    pub configs: HashMap<String, AgentConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    pub id: Option<String>,
    pub identity: Identity,
    pub model: ModelSelection,
    pub workspace: Option<String>,
    pub subagents: SubagentConfig,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Identity {
    pub name: Option<String>,
    pub emoji: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelSelection {
    pub primary: Option<String>,
    pub temperature: Option<serde_json::Value>,
    pub max_tokens: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SubagentConfig {
    pub allow_agents: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelsSection {
    pub providers: BTreeMap<String, ProviderConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub models: Vec<ProviderModel>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderModel {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub enabled: Option<bool>,
}

impl ChannelConfig {
    /// Channels are enabled unless explicitly switched off
    pub fn is_enabled(&self) -> bool {
        self.enabled != Some(false)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub port: Option<u16>,
}

impl RuntimeConfig {
    /// Display names keyed by `provider/modelId`
    pub fn model_names(&self) -> HashMap<String, String> {
        let mut names = HashMap::new();
        for (provider, config) in &self.models.providers {
            for model in &config.models {
                let name = model.name.clone().unwrap_or_else(|| model.id.clone());
                names.insert(format!("{}/{}", provider, model.id), name);
            }
        }
        names
    }

    pub fn find_agent(&self, agent_id: &str) -> Option<&AgentConfig> {
        self.agents
            .list
            .iter()
            .find(|a| a.id.as_deref() == Some(agent_id))
    }

    pub fn extra_agent(&self, agent_id: &str) -> Option<&AgentConfig> {
        self.agents.configs.get(agent_id)
    }
}

/// Read the registry file. Absent or unreadable config degrades to `None`.
pub fn load_runtime_config(paths: &RuntimePaths) -> Option<RuntimeConfig> {
    let path = paths.config_file();
    let content = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) => {
            log::debug!("Runtime config {:?} not readable: {}", path, e);
            return None;
        }
    };

    match serde_json::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            log::warn!("Failed to parse runtime config {:?}: {}", path, e);
            None
        }
    }
}

/// Fallback role label by well-known agent id
pub fn default_role(agent_id: &str) -> Option<&'static str> {
    match agent_id {
        "main" => Some("Chief Coordinator"),
        "assistant" => Some("Assistant"),
        "system-engineer" => Some("System Engineer"),
        "health-expert" => Some("Health Advisor"),
        "coder" => Some("Programmer"),
        "designer" => Some("Designer"),
        "writer" => Some("Copywriter"),
        "analyst" => Some("Analyst"),
        "tester" => Some("Test Engineer"),
        "devops" => Some("DevOps Engineer"),
        _ => None,
    }
}
