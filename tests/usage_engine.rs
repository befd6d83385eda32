//! End-to-end checks of the usage engine over a runtime home on disk

use std::fs;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use agent_dashboard_lib::usage::{list_agents, load_runtime_config, DashboardConfig, RuntimePaths, UsageAggregator};
use agent_dashboard_lib::AppState;

fn at(ts: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&Utc)
}

fn write_session(paths: &RuntimePaths, agent: &str, session: &str, lines: &[String]) {
    fs::create_dir_all(paths.sessions_dir(agent)).unwrap();
    fs::write(paths.session_file(agent, session), lines.join("\n") + "\n").unwrap();
}

fn assistant(ts: &str) -> String {
    format!(
        r#"{{"type":"message","timestamp":"{}","message":{{"role":"assistant","content":"ok"}}}}"#,
        ts
    )
}

fn model_change(provider: &str, model: &str, ts: &str) -> String {
    format!(
        r#"{{"type":"model_change","provider":"{}","modelId":"{}","timestamp":"{}"}}"#,
        provider, model, ts
    )
}

/// Agent A: three gpt-4 turns on 2024-01-01. Agent B: two claude turns on 2024-01-02.
fn two_agent_home() -> (TempDir, RuntimePaths) {
    let tmp = TempDir::new().unwrap();
    let paths = RuntimePaths::new(tmp.path());

    write_session(
        &paths,
        "agent-a",
        "s1",
        &[
            model_change("openai", "gpt-4", "2024-01-01T08:00:00Z"),
            assistant("2024-01-01T08:01:00Z"),
            assistant("2024-01-01T09:00:00Z"),
            assistant("2024-01-01T23:59:59Z"),
        ],
    );
    write_session(
        &paths,
        "agent-b",
        "s1",
        &[
            model_change("anthropic", "claude", "2024-01-02T10:00:00Z"),
            "not json at all".to_string(),
            assistant("2024-01-02T10:00:01Z"),
            assistant("2024-01-02T10:05:00Z"),
        ],
    );

    (tmp, paths)
}

#[tokio::test]
async fn test_two_agent_scenario() {
    let (_tmp, paths) = two_agent_home();
    let agents = list_agents(&paths, None);
    assert_eq!(agents.len(), 2);

    let aggregator = UsageAggregator::new(paths);
    let snapshot = aggregator
        .aggregate_at(&agents, 30, at("2024-01-15T00:00:00Z"))
        .await;

    let by_model: Vec<(String, String, u64)> = snapshot
        .by_model
        .iter()
        .map(|m| (m.provider.clone(), m.model_id.clone(), m.count))
        .collect();
    assert_eq!(
        by_model,
        vec![
            ("openai".to_string(), "gpt-4".to_string(), 3),
            ("anthropic".to_string(), "claude".to_string(), 2),
        ]
    );

    let days: Vec<&str> = snapshot.by_day.iter().map(|d| d.date.as_str()).collect();
    assert_eq!(days, vec!["2024-01-01", "2024-01-02"]);
    assert_eq!(snapshot.summary.total_calls, 5);
    assert_eq!(snapshot.summary.total_agents, 2);
    assert_eq!(snapshot.summary.date_range, "2024-01-01 ~ 2024-01-02");

    // Conservation across every grouping
    let model_sum: u64 = snapshot.by_model.iter().map(|m| m.count).sum();
    let agent_sum: u64 = snapshot.by_agent.iter().map(|a| a.total).sum();
    let day_sum: u64 = snapshot.by_day.iter().map(|d| d.total).sum();
    assert_eq!(model_sum, 5);
    assert_eq!(agent_sum, 5);
    assert_eq!(day_sum, 5);
}

#[tokio::test]
async fn test_aggregation_is_idempotent() {
    let (_tmp, paths) = two_agent_home();
    let agents = list_agents(&paths, None);
    let aggregator = UsageAggregator::new(paths);
    let now = at("2024-01-15T00:00:00Z");

    let first = aggregator.aggregate_at(&agents, 30, now).await;
    let second = aggregator.aggregate_at(&agents, 30, now).await;
    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
    assert_eq!(aggregator.scan_count(), 2);
}

#[tokio::test]
async fn test_lookback_boundary_is_inclusive() {
    let tmp = TempDir::new().unwrap();
    let paths = RuntimePaths::new(tmp.path());
    write_session(
        &paths,
        "main",
        "s1",
        &[
            model_change("openai", "gpt-4", "2024-01-01T00:00:00Z"),
            assistant("2024-01-01T23:59:59.999Z"),
            assistant("2024-01-02T00:00:00.000Z"),
        ],
    );

    let agents = list_agents(&paths, None);
    let aggregator = UsageAggregator::new(paths);
    let snapshot = aggregator
        .aggregate_at(&agents, 30, at("2024-02-01T00:00:00Z"))
        .await;

    assert_eq!(snapshot.summary.total_calls, 1);
    assert_eq!(snapshot.by_day[0].date, "2024-01-02");
}

#[tokio::test]
async fn test_registry_default_model_and_names() {
    let tmp = TempDir::new().unwrap();
    let paths = RuntimePaths::new(tmp.path());
    fs::write(
        paths.config_file(),
        r#"{
            "agents": {"list": [{"id": "main", "identity": {"name": "Main"}, "model": {"primary": "openai/gpt-4o"}}]},
            "models": {"providers": {"openai": {"models": [{"id": "gpt-4o", "name": "GPT-4o"}]}}}
        }"#,
    )
    .unwrap();
    // No model events at all: the configured default applies
    write_session(&paths, "main", "s1", &[assistant("2024-01-10T00:00:00Z")]);

    let config = load_runtime_config(&paths).unwrap();
    let agents = list_agents(&paths, Some(&config));
    let aggregator = UsageAggregator::new(paths);
    let snapshot = aggregator
        .aggregate_at(&agents, 30, at("2024-01-15T00:00:00Z"))
        .await;

    assert_eq!(snapshot.by_model.len(), 1);
    assert_eq!(snapshot.by_model[0].model_name, "GPT-4o");
    assert_eq!(snapshot.by_agent[0].agent_name, "Main");
}

#[tokio::test]
async fn test_concurrent_usage_requests_share_one_scan() {
    let (tmp, paths) = two_agent_home();
    let config = DashboardConfig {
        runtime_home: Some(paths.home().to_string_lossy().into_owned()),
        data_dir: Some(tmp.path().join("dashboard").to_string_lossy().into_owned()),
        ..Default::default()
    };
    let state = Arc::new(AppState::new(config));

    let (a, b) = tokio::join!(state.usage(30), state.usage(30));
    assert_eq!(a, b);
    assert_eq!(state.aggregator.scan_count(), 1);

    // A different window is a different cache key
    state.usage(7).await;
    assert_eq!(state.aggregator.scan_count(), 2);

    state.clear_caches();
    state.usage(30).await;
    assert_eq!(state.aggregator.scan_count(), 3);
}

#[tokio::test]
async fn test_registry_written_after_startup_renames_models() {
    let tmp = TempDir::new().unwrap();
    let paths = RuntimePaths::new(tmp.path().join("runtime"));
    write_session(
        &paths,
        "main",
        "s1",
        &[
            model_change("openai", "gpt-4o", "2099-01-01T00:00:00Z"),
            assistant("2099-01-01T00:00:01Z"),
        ],
    );
    let state = AppState::new(DashboardConfig {
        runtime_home: Some(paths.home().to_string_lossy().into_owned()),
        data_dir: Some(tmp.path().join("dashboard").to_string_lossy().into_owned()),
        ..Default::default()
    });

    let before = state.usage(30).await;
    assert_eq!(before.by_model[0].model_name, "gpt-4o");

    fs::write(
        paths.config_file(),
        r#"{"models": {"providers": {"openai": {"models": [{"id": "gpt-4o", "name": "GPT-4o"}]}}}}"#,
    )
    .unwrap();
    state.clear_caches();

    let after = state.usage(30).await;
    assert_eq!(after.by_model[0].model_name, "GPT-4o");
}

#[tokio::test]
async fn test_unbounded_window_does_not_overflow() {
    let (tmp, paths) = two_agent_home();
    let state = AppState::new(DashboardConfig {
        runtime_home: Some(paths.home().to_string_lossy().into_owned()),
        data_dir: Some(tmp.path().join("dashboard").to_string_lossy().into_owned()),
        ..Default::default()
    });

    let snapshot = state.usage(u32::MAX).await;
    assert_eq!(snapshot.summary.total_calls, 5);
}
