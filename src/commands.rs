//! HTTP handlers for the dashboard API

use std::fmt::Display;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::usage::alerts::{Alert, AlertError, AlertRule};
use crate::usage::history::{
    channel_stats, health_history, metrics_history, models_stats, tasks_stats, ChannelRange,
    ChannelStatsView, HealthHistoryView, MetricsHistoryView, ModelsStatsView, TaskStatsView,
};
use crate::usage::logs::{self, recent_logs, AnalyzeOptions, LogAnalysis, LogEntry};
use crate::usage::system::{system_overview, ChannelStatus, HealthStatus, SystemOverview};
use crate::usage::tasks::{
    agent_details, list_tasks, session_details, task_details, AgentDetails, SessionDetails, Task,
    TaskDetails,
};
use crate::usage::{agent_status, AgentInfo, ReaderError, UsageSnapshot};
use crate::AppState;

type AppStateRef = State<Arc<AppState>>;
type ApiResult<T> = Result<Json<T>, ApiError>;

/// Log lines bundled into the dashboard payload
const DASHBOARD_LOG_LINES: usize = 50;

/// Upper bound for `/api/logs/recent?count=`
const MAX_LOG_LINES: usize = 1000;

/// Error body `{ "error": message }` with a status code
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(e: impl Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        }
    }
}

impl From<ReaderError> for ApiError {
    fn from(e: ReaderError) -> Self {
        let status = if e.is_not_found() {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<AlertError> for ApiError {
    fn from(e: AlertError) -> Self {
        Self::internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            log::error!("Request failed: {}", self.message);
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Run file-heavy work off the async workers
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ReaderError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::from)
}

#[derive(Debug, Deserialize)]
pub struct HoursQuery {
    hours: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CountQuery {
    count: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct DaysQuery {
    days: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    range: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeQuery {
    hours: Option<u32>,
    level: Option<String>,
    keyword: Option<String>,
}

/// Get the health score and its issues
pub async fn get_health(State(state): AppStateRef) -> Json<HealthStatus> {
    Json(state.probe().await.health)
}

/// Get host and gateway process information
pub async fn get_system_overview(State(state): AppStateRef) -> Json<SystemOverview> {
    let probe = state.probe().await;
    Json(system_overview(probe.runtime.as_ref(), probe.gateway.as_ref()))
}

/// Get every configured or discovered agent
pub async fn get_agents(State(state): AppStateRef) -> Json<Vec<AgentInfo>> {
    Json(state.agents().await)
}

/// Get one agent's session-derived status
pub async fn get_agent_status(State(state): AppStateRef, Path(id): Path<String>) -> ApiResult<Value> {
    let paths = state.paths.clone();
    let agent_id = id.clone();
    let status = blocking(move || Ok(agent_status(&paths, &agent_id))).await?;
    Ok(Json(json!({
        "id": id,
        "status": status.status,
        "sessionCount": status.session_count,
        "lastActivity": status.last_activity,
        "currentModel": status.current_model,
    })))
}

/// Get registry details and sessions of one agent
pub async fn get_agent_details(
    State(state): AppStateRef,
    Path(id): Path<String>,
) -> ApiResult<AgentDetails> {
    let paths = state.paths.clone();
    let config = state.runtime_config();
    blocking(move || agent_details(&paths, config.as_ref(), &id))
        .await
        .map(Json)
}

/// Get the rendered transcript of one session
pub async fn get_session_details(
    State(state): AppStateRef,
    Path((agent_id, session_id)): Path<(String, String)>,
) -> ApiResult<SessionDetails> {
    let agents = state.agents().await;
    let paths = state.paths.clone();
    blocking(move || session_details(&paths, &agents, &agent_id, &session_id))
        .await
        .map(Json)
}

/// Get tasks whose session changed in the last few minutes
pub async fn get_current_tasks(State(state): AppStateRef) -> ApiResult<Vec<Task>> {
    let agents = state.agents().await;
    let paths = state.paths.clone();
    blocking(move || Ok(list_tasks(&paths, &agents).current))
        .await
        .map(Json)
}

/// Get recently completed tasks
pub async fn get_task_history(State(state): AppStateRef) -> ApiResult<Vec<Task>> {
    let agents = state.agents().await;
    let paths = state.paths.clone();
    blocking(move || Ok(list_tasks(&paths, &agents).history))
        .await
        .map(Json)
}

/// Get one task with its transcript
pub async fn get_task_details(
    State(state): AppStateRef,
    Path(id): Path<String>,
) -> ApiResult<TaskDetails> {
    let agents = state.agents().await;
    let paths = state.paths.clone();
    blocking(move || task_details(&paths, &agents, &id))
        .await
        .map(Json)
}

/// Get the status of each configured channel
pub async fn get_channels_status(State(state): AppStateRef) -> Json<Vec<ChannelStatus>> {
    Json(state.probe().await.channels)
}

/// Get the tail of the runtime log
pub async fn get_recent_logs(
    State(state): AppStateRef,
    Query(query): Query<CountQuery>,
) -> Json<Vec<LogEntry>> {
    let count = query.count.unwrap_or(DASHBOARD_LOG_LINES).min(MAX_LOG_LINES);
    Json(recent_logs(&state.paths, count))
}

/// Get level, hour and keyword statistics of the runtime log
pub async fn analyze_logs(
    State(state): AppStateRef,
    Query(query): Query<AnalyzeQuery>,
) -> ApiResult<LogAnalysis> {
    let options = AnalyzeOptions {
        hours: query.hours.unwrap_or(24),
        level: query.level,
        keyword: query.keyword,
    };
    let paths = state.paths.clone();
    blocking(move || logs::analyze_logs(&paths, &options))
        .await
        .map(Json)
}

/// Get gateway cpu and memory samples
pub async fn get_metrics_history(
    State(state): AppStateRef,
    Query(query): Query<HoursQuery>,
) -> Json<MetricsHistoryView> {
    Json(metrics_history(&state.history, query.hours.unwrap_or(24)))
}

/// Get health score samples
pub async fn get_health_history(
    State(state): AppStateRef,
    Query(query): Query<HoursQuery>,
) -> Json<HealthHistoryView> {
    Json(health_history(&state.history, query.hours.unwrap_or(24)))
}

/// Get channel message counts for today, the week or the month
pub async fn get_channel_stats(
    State(state): AppStateRef,
    Query(query): Query<RangeQuery>,
) -> Json<ChannelStatsView> {
    let range = ChannelRange::parse(query.range.as_deref().unwrap_or("today"));
    Json(channel_stats(&state.history, range))
}

/// Get the task duration distribution
pub async fn get_tasks_stats(State(state): AppStateRef) -> Json<TaskStatsView> {
    Json(tasks_stats(&state.history))
}

/// Get model shares from recorded usage
pub async fn get_models_stats(State(state): AppStateRef) -> Json<ModelsStatsView> {
    Json(models_stats(&state.history))
}

/// Get the model usage snapshot
pub async fn get_model_usage(
    State(state): AppStateRef,
    Query(query): Query<DaysQuery>,
) -> Json<UsageSnapshot> {
    let days = query.days.unwrap_or(state.config.usage_lookback_days);
    Json(state.usage(days).await)
}

/// Get the alert rules
pub async fn get_alert_rules(State(state): AppStateRef) -> Json<Vec<AlertRule>> {
    Json(state.alerts.lock().await.rules().to_vec())
}

/// Replace the alert rules
pub async fn set_alert_rules(
    State(state): AppStateRef,
    Json(rules): Json<Vec<AlertRule>>,
) -> ApiResult<Value> {
    state.alerts.lock().await.set_rules(rules)?;
    Ok(Json(json!({ "success": true, "message": "Alert rules updated" })))
}

/// Get fired alerts, newest first
pub async fn get_alert_history(
    State(state): AppStateRef,
    Query(query): Query<LimitQuery>,
) -> Json<Vec<Alert>> {
    Json(state.alerts.lock().await.history(query.limit.unwrap_or(100)))
}

/// Get alerts that have not resolved yet
pub async fn get_active_alerts(State(state): AppStateRef) -> Json<Vec<Alert>> {
    Json(state.alerts.lock().await.active_alerts())
}

/// Get everything the dashboard's first paint needs
pub async fn get_dashboard(State(state): AppStateRef) -> ApiResult<Value> {
    let probe = state.probe().await;
    let agents = probe.agents.clone();
    let paths = state.paths.clone();
    let tasks = blocking(move || Ok(list_tasks(&paths, &agents))).await?;
    let alerts = state.alerts.lock().await.active_alerts();

    Ok(Json(json!({
        "system": system_overview(probe.runtime.as_ref(), probe.gateway.as_ref()),
        "agents": probe.agents,
        "tasks": tasks,
        "channels": probe.channels,
        "logs": recent_logs(&state.paths, DASHBOARD_LOG_LINES),
        "health": probe.health,
        "alerts": alerts,
        "timestamp": Utc::now(),
    })))
}
