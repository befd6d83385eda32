//! Agent runtime dashboard - HTTP/WebSocket server over the runtime's files

mod commands;
mod server;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex as AsyncMutex};

use usage::logs::{recent_logs, LogEntry};
use usage::system::{
    channels_status, health_status, process_info, ChannelStatus, HealthStatus, ProcessInfo,
    GATEWAY_PROCESS, HEALTH_LOG_LINES,
};
use usage::{
    list_agents, load_runtime_config, AgentInfo, AlertEvaluator, CacheManager, DashboardConfig,
    HistoryStore, RuntimeConfig, RuntimePaths, UsageAggregator, UsageSnapshot,
};

pub use server::serve;

/// Buffered push messages per WebSocket subscriber
const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Shared state behind every handler and background task
pub struct AppState {
    pub config: DashboardConfig,
    pub paths: RuntimePaths,
    pub agents_cache: CacheManager<(), Vec<AgentInfo>>,
    pub usage_cache: CacheManager<u32, UsageSnapshot>,
    pub aggregator: Arc<UsageAggregator>,
    pub alerts: AsyncMutex<AlertEvaluator>,
    pub history: HistoryStore,
    pub updates: broadcast::Sender<String>,
}

/// One pass over the runtime's live state
#[derive(Debug, Clone)]
pub struct Probe {
    pub runtime: Option<RuntimeConfig>,
    pub gateway: Option<ProcessInfo>,
    pub agents: Vec<AgentInfo>,
    pub channels: Vec<ChannelStatus>,
    pub logs: Vec<LogEntry>,
    pub health: HealthStatus,
}

impl AppState {
    pub fn new(config: DashboardConfig) -> Self {
        let paths = config.runtime_paths();
        let data_dir = config.data_dir();
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        Self {
            aggregator: Arc::new(UsageAggregator::new(paths.clone())),
            agents_cache: CacheManager::new(),
            usage_cache: CacheManager::new(),
            alerts: AsyncMutex::new(AlertEvaluator::load(&data_dir)),
            history: HistoryStore::new(data_dir, config.retention_days),
            updates,
            paths,
            config,
        }
    }

    pub fn runtime_config(&self) -> Option<RuntimeConfig> {
        load_runtime_config(&self.paths)
    }

    /// Agent list, shared between callers for the scan cache TTL
    pub async fn agents(&self) -> Vec<AgentInfo> {
        let paths = self.paths.clone();
        let ttl = Duration::from_millis(self.config.scan_cache_ttl_ms);
        let result = self
            .agents_cache
            .get_or_compute((), ttl, || async move {
                tokio::task::spawn_blocking(move || {
                    let config = load_runtime_config(&paths);
                    list_agents(&paths, config.as_ref())
                })
                .await
            })
            .await;

        result.unwrap_or_else(|e| {
            log::warn!("Agent scan failed: {}", e);
            Vec::new()
        })
    }

    /// Model usage over the last `days` days, cached per window
    pub async fn usage(&self, days: u32) -> UsageSnapshot {
        let agents = self.agents().await;
        let aggregator = Arc::clone(&self.aggregator);
        let ttl = Duration::from_secs(self.config.usage_cache_ttl_secs);
        self.usage_cache
            .get_or_insert_with(days, ttl, || async move {
                aggregator.aggregate(&agents, days).await
            })
            .await
    }

    /// Gateway process, channels, recent log lines and the health score
    pub async fn probe(&self) -> Probe {
        let gateway = process_info(GATEWAY_PROCESS).await;
        let agents = self.agents().await;
        let runtime = self.runtime_config();
        let channels = channels_status(&self.paths, runtime.as_ref());
        let logs = recent_logs(&self.paths, HEALTH_LOG_LINES);
        let health = health_status(gateway.is_some(), &channels, &logs, &agents);

        Probe {
            runtime,
            gateway,
            agents,
            channels,
            logs,
            health,
        }
    }

    /// Drop cached scans, e.g. after the registry changed
    pub fn clear_caches(&self) {
        self.agents_cache.clear();
        self.usage_cache.clear();
    }
}

/// Start background tasks and serve until interrupted
pub async fn run(config: DashboardConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let state = Arc::new(AppState::new(config));
    log::info!("Runtime home: {:?}", state.paths.home());
    log::info!("Dashboard data: {:?}", state.history.dir());

    usage::start_background_tasks(Arc::clone(&state));
    serve(state).await
}
