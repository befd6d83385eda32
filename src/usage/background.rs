//! Background refresh and history recording for push-based updates

use std::fs;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::time::{interval, MissedTickBehavior};

use crate::usage::history::{HEALTH_SERIES, METRICS_SERIES, MODELS_SERIES, TASKS_SERIES};
use crate::usage::models::{HealthRecord, MetricRecord, ModelStatsRecord, TaskStatsRecord};
use crate::usage::system::{current_metrics, host_memory_percent, system_overview};
use crate::usage::tasks::{list_tasks, task_durations};
use crate::AppState;

/// Push message kinds on the update channel
pub const ALERT_MESSAGE: &str = "alert";
pub const UPDATE_MESSAGE: &str = "update";
pub const CONFIG_CHANGED_MESSAGE: &str = "config-changed";

/// Serialize a push message `{type, timestamp, data}`
pub fn push_message<T: Serialize>(kind: &str, data: &T) -> Option<String> {
    let message = json!({
        "type": kind,
        "timestamp": Utc::now(),
        "data": data,
    });
    match serde_json::to_string(&message) {
        Ok(s) => Some(s),
        Err(e) => {
            log::warn!("Failed to serialize {} message: {}", kind, e);
            None
        }
    }
}

fn send(state: &AppState, message: Option<String>) {
    // No subscribers is not an error
    if let Some(message) = message {
        let _ = state.updates.send(message);
    }
}

/// Start the refresh and history loops
pub fn start_background_tasks(state: Arc<AppState>) {
    let refresh = Duration::from_secs(state.config.refresh_interval_secs.max(1));
    let record = Duration::from_secs(state.config.history_interval_secs.max(1));

    tokio::spawn(refresh_loop(Arc::clone(&state), refresh));
    tokio::spawn(history_loop(state, record));
}

fn config_mtime(state: &AppState) -> Option<SystemTime> {
    fs::metadata(state.paths.config_file())
        .and_then(|m| m.modified())
        .ok()
}

async fn refresh_loop(state: Arc<AppState>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Skip the first tick (immediate)
    ticker.tick().await;

    let mut last_config = config_mtime(&state);

    loop {
        ticker.tick().await;

        let current_config = config_mtime(&state);
        if current_config != last_config {
            log::info!("Runtime config changed, clearing caches");
            last_config = current_config;
            state.clear_caches();
            let probe = state.probe().await;
            send(
                &state,
                push_message(
                    CONFIG_CHANGED_MESSAGE,
                    &json!({
                        "system": system_overview(probe.runtime.as_ref(), probe.gateway.as_ref()),
                        "agents": probe.agents,
                        "channels": probe.channels,
                    }),
                ),
            );
        }

        refresh_once(&state).await;
    }
}

/// One poll: probe, evaluate alerts, push updates
pub async fn refresh_once(state: &AppState) {
    let probe = state.probe().await;
    let metrics = current_metrics(
        probe.gateway.as_ref(),
        host_memory_percent(),
        &probe.health,
        &probe.logs,
    );

    let outcome = state.alerts.lock().await.check(&metrics);

    if !outcome.new.is_empty() {
        send(
            state,
            push_message(
                ALERT_MESSAGE,
                &json!({ "alerts": outcome.new, "active": outcome.active }),
            ),
        );
    }

    let tasks = list_tasks(&state.paths, &probe.agents);
    send(
        state,
        push_message(
            UPDATE_MESSAGE,
            &json!({
                "system": system_overview(probe.runtime.as_ref(), probe.gateway.as_ref()),
                "agents": probe.agents,
                "tasks": tasks,
                "channels": probe.channels,
                "health": probe.health,
                "alerts": outcome.active,
            }),
        ),
    );
}

async fn history_loop(state: Arc<AppState>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        record_history(&state).await;
    }
}

/// Append one sample to every history series. Failures are logged per series.
pub async fn record_history(state: &AppState) {
    let now = Utc::now();
    let probe = state.probe().await;
    let history = &state.history;

    let gateway_status = match probe.gateway {
        Some(_) => "running",
        None => "stopped",
    };
    let metric = MetricRecord {
        timestamp: now,
        cpu: probe.gateway.as_ref().map(|g| g.cpu).unwrap_or(0.0),
        memory: probe.gateway.as_ref().map(|g| g.memory_mb()).unwrap_or(0.0),
        gateway_status: gateway_status.to_string(),
    };
    if let Err(e) = history.append(METRICS_SERIES, metric) {
        log::warn!("Failed to record metrics: {}", e);
    }

    let health = HealthRecord {
        timestamp: now,
        score: probe.health.score,
        status: probe.health.status.as_str().to_string(),
        issues: probe.health.issues.iter().map(|i| i.message.clone()).collect(),
    };
    if let Err(e) = history.append(HEALTH_SERIES, health) {
        log::warn!("Failed to record health: {}", e);
    }

    let counts: Vec<(String, u64)> = probe
        .channels
        .iter()
        .map(|c| (c.name.clone(), c.message_count))
        .collect();
    if !counts.is_empty() {
        if let Err(e) = history.record_channel_counts(&counts) {
            log::warn!("Failed to record channel stats: {}", e);
        }
    }

    let durations = task_durations(&state.paths, &probe.agents);
    if !durations.is_empty() {
        let record = TaskStatsRecord {
            timestamp: now,
            count: durations.len(),
            execution_times: durations,
        };
        if let Err(e) = history.append(TASKS_SERIES, record) {
            log::warn!("Failed to record task stats: {}", e);
        }
    }

    let usage = state.usage(state.config.usage_lookback_days).await;
    if let Err(e) = history.append(MODELS_SERIES, ModelStatsRecord::from_snapshot(now, &usage)) {
        log::warn!("Failed to record model usage: {}", e);
    }
}
