//! Usage aggregation across all agents' session logs

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use tokio::task::JoinSet;

use crate::usage::attribution::ModelAttributionTracker;
use crate::usage::config::{load_runtime_config, RuntimePaths};
use crate::usage::models::{
    AgentInfo, AgentUsage, DayUsage, ModelRef, ModelUsage, UsageSnapshot, UsageSummary,
    NO_DATE_RANGE, UNKNOWN_DATE,
};
use crate::usage::reader::{list_sessions, read_session};

/// Counts from a single session, keyed by `(model, date)`
#[derive(Debug, Default)]
struct SessionTally {
    counts: HashMap<(ModelRef, String), u64>,
}

/// A session selected for scanning
struct SessionJob {
    agent_id: String,
    path: PathBuf,
    default_model: Option<String>,
}

/// Lower bound of the lookback window. Events at exactly the cutoff count.
/// A window reaching past the representable range covers everything.
pub fn lookback_cutoff(now: DateTime<Utc>, lookback_days: u32) -> DateTime<Utc> {
    now.checked_sub_signed(Duration::days(i64::from(lookback_days)))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Count attributed assistant turns of one session.
/// An unreadable file contributes nothing.
fn tally_session(path: &Path, default_model: Option<&str>, cutoff: DateTime<Utc>) -> SessionTally {
    let mut tally = SessionTally::default();

    let events = match read_session(path) {
        Ok(events) => events,
        Err(e) => {
            warn!("Failed to read session {:?}: {}", path, e);
            return tally;
        }
    };

    let mut tracker = ModelAttributionTracker::with_default(default_model);
    for event in events {
        let Some(model) = tracker.observe(&event) else {
            continue;
        };

        // Turns without a timestamp are counted, their file already passed the mtime check
        let timestamp = event.timestamp();
        if matches!(timestamp, Some(ts) if ts < cutoff) {
            continue;
        }

        let date = timestamp
            .map(|ts| ts.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| UNKNOWN_DATE.to_string());
        *tally.counts.entry((model, date)).or_insert(0) += 1;
    }

    tally
}

/// Scans session logs and builds the model usage snapshot.
///
/// Holds no per-call state, so it is safe to call from the poller and from
/// request handlers at the same time. Collapsing of duplicate scans is the
/// job of the cache in front of it. Model display names are reread from
/// the registry on every scan.
#[derive(Debug)]
pub struct UsageAggregator {
    paths: RuntimePaths,
    scans: AtomicU64,
}

impl UsageAggregator {
    pub fn new(paths: RuntimePaths) -> Self {
        Self {
            paths,
            scans: AtomicU64::new(0),
        }
    }

    /// Number of full scans performed so far
    pub fn scan_count(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    pub async fn aggregate(&self, agents: &[AgentInfo], lookback_days: u32) -> UsageSnapshot {
        self.aggregate_at(agents, lookback_days, Utc::now()).await
    }

    /// Aggregate with an explicit "now", so window boundaries are testable
    pub async fn aggregate_at(
        &self,
        agents: &[AgentInfo],
        lookback_days: u32,
        now: DateTime<Utc>,
    ) -> UsageSnapshot {
        self.scans.fetch_add(1, Ordering::Relaxed);
        let cutoff = lookback_cutoff(now, lookback_days);

        let jobs = self.collect_jobs(agents, cutoff);
        debug!("Aggregating usage over {} sessions", jobs.len());

        // Fan out one blocking read per session; each fills its own tally
        let mut set = JoinSet::new();
        for job in jobs {
            set.spawn_blocking(move || {
                let tally = tally_session(&job.path, job.default_model.as_deref(), cutoff);
                (job.agent_id, tally)
            });
        }

        let mut tallies = Vec::new();
        while let Some(result) = set.join_next().await {
            match result {
                Ok(pair) => tallies.push(pair),
                Err(e) => warn!("Session scan task failed: {}", e),
            }
        }

        let model_names = load_runtime_config(&self.paths)
            .map(|c| c.model_names())
            .unwrap_or_default();

        // All reads are done; merging is the only shared mutation
        merge(agents, tallies, &model_names, lookback_days)
    }

    /// Active sessions whose mtime is inside the window. Older files are
    /// never opened.
    fn collect_jobs(&self, agents: &[AgentInfo], cutoff: DateTime<Utc>) -> Vec<SessionJob> {
        let mut jobs = Vec::new();
        for info in agents {
            let sessions = match list_sessions(&self.paths, &info.agent.id) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Failed to list sessions for agent {}: {}", info.agent.id, e);
                    continue;
                }
            };

            for session in sessions {
                if session.modified_utc() < cutoff {
                    continue;
                }
                jobs.push(SessionJob {
                    agent_id: info.agent.id.clone(),
                    path: session.path,
                    default_model: info.agent.default_model.clone(),
                });
            }
        }
        jobs
    }
}

fn merge(
    agents: &[AgentInfo],
    tallies: Vec<(String, SessionTally)>,
    model_names: &HashMap<String, String>,
    lookback_days: u32,
) -> UsageSnapshot {
    let mut model_counts: HashMap<ModelRef, u64> = HashMap::new();
    let mut agent_counts: HashMap<String, BTreeMap<String, u64>> = HashMap::new();
    let mut day_counts: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
    let mut total_calls: u64 = 0;

    for (agent_id, tally) in tallies {
        for ((model, date), count) in tally.counts {
            let key = model.key();
            *agent_counts
                .entry(agent_id.clone())
                .or_default()
                .entry(key.clone())
                .or_insert(0) += count;
            *day_counts.entry(date).or_default().entry(key).or_insert(0) += count;
            *model_counts.entry(model).or_insert(0) += count;
            total_calls += count;
        }
    }

    if total_calls == 0 {
        return UsageSnapshot::empty(lookback_days);
    }

    let mut by_model: Vec<ModelUsage> = model_counts
        .into_iter()
        .map(|(model, count)| ModelUsage {
            model_name: model_names
                .get(&model.key())
                .cloned()
                .unwrap_or_else(|| model.model_id.clone()),
            provider: model.provider,
            model_id: model.model_id,
            count,
        })
        .collect();
    by_model.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.provider.cmp(&b.provider))
            .then_with(|| a.model_id.cmp(&b.model_id))
    });

    let mut by_agent: Vec<AgentUsage> = agent_counts
        .into_iter()
        .map(|(agent_id, models)| {
            let info = agents.iter().find(|a| a.agent.id == agent_id);
            AgentUsage {
                agent_name: info
                    .map(|a| a.agent.name.clone())
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| agent_id.clone()),
                agent_emoji: info
                    .map(|a| a.agent.emoji.clone())
                    .filter(|e| !e.is_empty())
                    .unwrap_or_else(|| "🤖".to_string()),
                total: models.values().sum(),
                models,
                agent_id,
            }
        })
        .collect();
    by_agent.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.agent_id.cmp(&b.agent_id)));

    // BTreeMap keeps days ascending
    let by_day: Vec<DayUsage> = day_counts
        .into_iter()
        .map(|(date, counts)| DayUsage {
            total: counts.values().sum(),
            date,
            counts,
        })
        .collect();

    let mut dated = by_day.iter().map(|d| d.date.as_str()).filter(|d| *d != UNKNOWN_DATE);
    let date_range = match (dated.next(), dated.last()) {
        (Some(first), Some(last)) => format!("{} ~ {}", first, last),
        (Some(only), None) => format!("{} ~ {}", only, only),
        _ => NO_DATE_RANGE.to_string(),
    };

    UsageSnapshot {
        summary: UsageSummary {
            total_calls,
            total_models: by_model.len() as u32,
            total_agents: by_agent.len() as u32,
            date_range,
            days: lookback_days,
        },
        by_model,
        by_agent,
        by_day,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::models::{Agent, AgentStatus};
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    fn agent(id: &str, default_model: Option<&str>) -> AgentInfo {
        AgentInfo {
            agent: Agent {
                id: id.to_string(),
                name: id.to_uppercase(),
                emoji: "🤖".to_string(),
                default_model: default_model.map(str::to_string),
                ..Default::default()
            },
            model: None,
            status: AgentStatus::Active,
            session_count: 1,
            last_activity: None,
        }
    }

    fn write_lines(paths: &RuntimePaths, agent_id: &str, session: &str, lines: &[String]) {
        let dir = paths.sessions_dir(agent_id);
        fs::create_dir_all(&dir).unwrap();
        let mut file = fs::File::create(paths.session_file(agent_id, session)).unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
    }

    fn assistant_at(ts: &str) -> String {
        format!(
            r#"{{"type":"message","timestamp":"{}","message":{{"role":"assistant","content":"ok"}}}}"#,
            ts
        )
    }

    #[tokio::test]
    async fn test_counts_are_conserved_across_groupings() {
        let tmp = TempDir::new().unwrap();
        let paths = RuntimePaths::new(tmp.path());
        let now = Utc::now();
        let today = now.to_rfc3339();
        let yesterday = (now - Duration::days(1)).to_rfc3339();

        write_lines(
            &paths,
            "a",
            "s1",
            &[
                r#"{"type":"model_change","provider":"openai","modelId":"gpt-4"}"#.to_string(),
                assistant_at(&today),
                assistant_at(&yesterday),
                r#"{"type":"message","message":{"role":"assistant","provider":"x","model":"y"}}"#
                    .to_string(),
                "garbage".to_string(),
            ],
        );
        write_lines(&paths, "b", "s2", &[assistant_at(&today)]);

        let aggregator = UsageAggregator::new(paths);
        let snapshot = aggregator
            .aggregate_at(&[agent("a", None), agent("b", Some("anthropic/claude"))], 30, now)
            .await;

        let by_model: u64 = snapshot.by_model.iter().map(|m| m.count).sum();
        let by_agent: u64 = snapshot.by_agent.iter().map(|a| a.total).sum();
        let by_day: u64 = snapshot.by_day.iter().map(|d| d.total).sum();
        assert_eq!(snapshot.summary.total_calls, 4);
        assert_eq!(by_model, 4);
        assert_eq!(by_agent, 4);
        assert_eq!(by_day, 4);

        // Untimestamped turn lands in the unknown bucket, last
        assert_eq!(snapshot.by_day.last().unwrap().date, UNKNOWN_DATE);
        // Agent default model used when nothing else is known
        assert!(snapshot
            .by_model
            .iter()
            .any(|m| m.provider == "anthropic" && m.model_id == "claude"));
        assert_eq!(aggregator.scan_count(), 1);
    }

    #[tokio::test]
    async fn test_lookback_fence_post() {
        let tmp = TempDir::new().unwrap();
        let paths = RuntimePaths::new(tmp.path());
        let now = DateTime::parse_from_rfc3339("2024-02-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        write_lines(
            &paths,
            "a",
            "s1",
            &[
                assistant_at("2024-01-02T00:00:00.000Z"),
                assistant_at("2024-01-01T23:59:59.999Z"),
            ],
        );

        let aggregator = UsageAggregator::new(paths);
        let snapshot = aggregator.aggregate_at(&[agent("a", None)], 30, now).await;

        assert_eq!(snapshot.summary.total_calls, 1);
        assert_eq!(snapshot.by_day[0].date, "2024-01-02");
        assert_eq!(snapshot.summary.date_range, "2024-01-02 ~ 2024-01-02");
    }

    #[tokio::test]
    async fn test_stale_files_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let paths = RuntimePaths::new(tmp.path());
        write_lines(&paths, "a", "s1", &[assistant_at("2024-01-01T00:00:00Z")]);

        // Far in the future, the file's mtime is older than the window
        let now = Utc::now() + Duration::days(400);
        let aggregator = UsageAggregator::new(paths);
        let snapshot = aggregator.aggregate_at(&[agent("a", None)], 30, now).await;

        assert_eq!(snapshot, UsageSnapshot::empty(30));
    }

    #[tokio::test]
    async fn test_model_display_names_and_ordering() {
        let tmp = TempDir::new().unwrap();
        let paths = RuntimePaths::new(tmp.path());
        let ts = Utc::now().to_rfc3339();
        let tagged = |p: &str, m: &str| {
            format!(
                r#"{{"type":"message","timestamp":"{}","message":{{"role":"assistant","provider":"{}","model":"{}"}}}}"#,
                ts, p, m
            )
        };
        write_lines(
            &paths,
            "a",
            "s1",
            &[tagged("zeta", "m"), tagged("alpha", "m"), tagged("beta", "m"), tagged("beta", "m")],
        );

        fs::write(
            paths.config_file(),
            r#"{"models": {"providers": {"beta": {"models": [{"id": "m", "name": "Beta M"}]}}}}"#,
        )
        .unwrap();
        let aggregator = UsageAggregator::new(paths);
        let snapshot = aggregator.aggregate(&[agent("a", None)], 7).await;

        let keys: Vec<_> = snapshot
            .by_model
            .iter()
            .map(|m| format!("{}/{}", m.provider, m.model_id))
            .collect();
        assert_eq!(keys, vec!["beta/m", "alpha/m", "zeta/m"]);
        assert_eq!(snapshot.by_model[0].model_name, "Beta M");
        assert_eq!(snapshot.by_model[1].model_name, "m");
        assert_eq!(snapshot.summary.days, 7);
    }

    #[tokio::test]
    async fn test_display_names_follow_registry_edits() {
        let tmp = TempDir::new().unwrap();
        let paths = RuntimePaths::new(tmp.path());
        let ts = Utc::now().to_rfc3339();
        write_lines(
            &paths,
            "a",
            "s1",
            &[format!(
                r#"{{"type":"message","timestamp":"{}","message":{{"role":"assistant","provider":"openai","model":"gpt-4o"}}}}"#,
                ts
            )],
        );
        let aggregator = UsageAggregator::new(paths.clone());

        let before = aggregator.aggregate(&[agent("a", None)], 30).await;
        assert_eq!(before.by_model[0].model_name, "gpt-4o");

        fs::write(
            paths.config_file(),
            r#"{"models": {"providers": {"openai": {"models": [{"id": "gpt-4o", "name": "GPT-4o"}]}}}}"#,
        )
        .unwrap();
        let after = aggregator.aggregate(&[agent("a", None)], 30).await;
        assert_eq!(after.by_model[0].model_name, "GPT-4o");
    }

    #[tokio::test]
    async fn test_huge_window_covers_everything() {
        let now = Utc::now();
        assert_eq!(lookback_cutoff(now, u32::MAX), DateTime::<Utc>::MIN_UTC);

        let tmp = TempDir::new().unwrap();
        let paths = RuntimePaths::new(tmp.path());
        write_lines(&paths, "a", "s1", &[assistant_at("2001-01-01T00:00:00Z")]);

        let aggregator = UsageAggregator::new(paths);
        let snapshot = aggregator.aggregate_at(&[agent("a", None)], u32::MAX, now).await;
        assert_eq!(snapshot.summary.total_calls, 1);
        assert_eq!(snapshot.summary.days, u32::MAX);
    }

    #[tokio::test]
    async fn test_unreadable_session_is_isolated() {
        let tmp = TempDir::new().unwrap();
        let paths = RuntimePaths::new(tmp.path());
        let ts = Utc::now().to_rfc3339();
        write_lines(&paths, "a", "good", &[assistant_at(&ts), assistant_at(&ts)]);
        // Matches the session glob but every read fails
        fs::create_dir_all(paths.session_file("a", "bad")).unwrap();

        let aggregator = UsageAggregator::new(paths.clone());
        let sessions = list_sessions(&paths, "a").unwrap();
        assert_eq!(sessions.len(), 2);

        let snapshot = aggregator.aggregate(&[agent("a", None)], 30).await;
        assert_eq!(snapshot.summary.total_calls, 2);
        assert_eq!(snapshot.by_agent[0].total, 2);

        // Both failure paths contribute nothing
        let cutoff = lookback_cutoff(Utc::now(), 30);
        let missing = paths.session_file("a", "gone");
        assert!(tally_session(&missing, None, cutoff).counts.is_empty());
        assert!(tally_session(&paths.session_file("a", "bad"), None, cutoff).counts.is_empty());
    }
}
