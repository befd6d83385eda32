//! Agent runtime dashboard server

use agent_dashboard_lib::usage::DashboardConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // RUST_LOG overrides; `log` records are bridged into the subscriber
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let config = DashboardConfig::load();
    if let Err(e) = agent_dashboard_lib::run(config).await {
        log::error!("Dashboard stopped: {}", e);
        std::process::exit(1);
    }
}
