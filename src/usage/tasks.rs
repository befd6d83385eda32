//! Tasks (one per session) and the agent/session/task detail views

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::usage::config::{default_role, AgentConfig, RuntimeConfig, RuntimePaths};
use crate::usage::models::{AgentInfo, AgentStatus, Event, Role};
use crate::usage::reader::{
    agent_status, list_sessions, read_session, read_session_events, text_lines, ReaderError,
    SessionFile,
};
use crate::usage::title::{extract_title, DEFAULT_MAX_LEN, UNTITLED};

/// Session files examined per agent when listing tasks
pub const TASK_FILES_PER_AGENT: usize = 10;

/// Completed tasks returned by [`list_tasks`]
pub const TASK_HISTORY_LIMIT: usize = 20;

/// Sessions shown in agent details
pub const AGENT_DETAIL_SESSIONS: usize = 50;

/// A session modified within this window is a running task
const CURRENT_WINDOW_MINUTES: i64 = 5;

/// Task durations outside (0, 3600) seconds are discarded
const MAX_TASK_SECS: f64 = 3600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub title: String,
    pub status: TaskStatus,
    pub last_update: DateTime<Utc>,
    pub message_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskList {
    pub current: Vec<Task>,
    pub history: Vec<Task>,
}

/// Non-empty lines in a file
fn count_lines(session: &SessionFile) -> Result<usize, ReaderError> {
    Ok(text_lines(&session.path)?.count())
}

/// Title from the first user message that yields one
pub fn task_title<'a, I>(events: I) -> String
where
    I: IntoIterator<Item = &'a Event>,
{
    events
        .into_iter()
        .filter_map(|e| match e {
            Event::Message {
                role: Role::User,
                content,
                ..
            } if !content.trim().is_empty() => Some(extract_title(content, DEFAULT_MAX_LEN)),
            _ => None,
        })
        .find(|t| t != UNTITLED)
        .unwrap_or_else(|| UNTITLED.to_string())
}

fn build_task(agent: &AgentInfo, session: &SessionFile, now: DateTime<Utc>) -> Result<Task, ReaderError> {
    let events = read_session_events(&session.path)?;
    let last_update = session.modified_utc();
    let status = if now - last_update < Duration::minutes(CURRENT_WINDOW_MINUTES) {
        TaskStatus::Running
    } else {
        TaskStatus::Completed
    };

    Ok(Task {
        id: session.session_id.clone(),
        agent_id: agent.agent.id.clone(),
        agent_name: agent.agent.name.clone(),
        title: task_title(&events),
        status,
        last_update,
        message_count: count_lines(session)?,
    })
}

pub fn list_tasks(paths: &RuntimePaths, agents: &[AgentInfo]) -> TaskList {
    list_tasks_at(paths, agents, Utc::now())
}

/// Running tasks and the newest completed ones, both newest first
pub fn list_tasks_at(paths: &RuntimePaths, agents: &[AgentInfo], now: DateTime<Utc>) -> TaskList {
    let mut list = TaskList::default();

    for agent in agents {
        let sessions = match list_sessions(paths, &agent.agent.id) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("Skipping tasks of agent {}: {}", agent.agent.id, e);
                continue;
            }
        };

        for session in sessions.iter().take(TASK_FILES_PER_AGENT) {
            match build_task(agent, session, now) {
                Ok(task) if task.status == TaskStatus::Running => list.current.push(task),
                Ok(task) => list.history.push(task),
                Err(e) => log::debug!("Skipping task {:?}: {}", session.path, e),
            }
        }
    }

    list.current.sort_by(|a, b| b.last_update.cmp(&a.last_update));
    list.history.sort_by(|a, b| b.last_update.cmp(&a.last_update));
    list.history.truncate(TASK_HISTORY_LIMIT);
    list
}

/// Span between the first and last timestamped event, in seconds.
/// Sessions without two timestamps fall back to file birth and mtime.
pub fn session_duration_secs(session: &SessionFile) -> Option<f64> {
    let mut first = None;
    let mut last = None;
    if let Ok(events) = read_session(&session.path) {
        for ts in events.filter_map(|e| e.timestamp()) {
            first.get_or_insert(ts);
            last = Some(ts);
        }
    }

    let (start, end) = match (first, last) {
        (Some(start), Some(end)) if end > start => (start, end),
        _ => (session.created_utc(), session.modified_utc()),
    };
    let secs = (end - start).num_milliseconds() as f64 / 1000.0;
    (secs > 0.0 && secs < MAX_TASK_SECS).then_some(secs)
}

/// Durations of the tasks [`list_tasks`] would consider
pub fn task_durations(paths: &RuntimePaths, agents: &[AgentInfo]) -> Vec<f64> {
    agents
        .iter()
        .flat_map(|agent| {
            list_sessions(paths, &agent.agent.id)
                .unwrap_or_default()
                .into_iter()
                .take(TASK_FILES_PER_AGENT)
        })
        .filter_map(|s| session_duration_secs(&s))
        .collect()
}

/// Who is speaking in a rendered transcript
#[derive(Debug, Clone)]
pub struct Speaker {
    pub name: String,
    pub emoji: String,
    pub role: String,
}

impl Speaker {
    fn label(&self) -> String {
        format!("{} ({})", self.name, self.role)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayMessage {
    pub timestamp: Option<DateTime<Utc>>,
    pub role: String,
    pub sender_name: String,
    pub sender_emoji: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Render transcript events for display. Unknown lines are dropped.
pub fn render_transcript(events: &[Event], speaker: &Speaker) -> Vec<DisplayMessage> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Message {
                role,
                content,
                timestamp,
                ..
            } => {
                let (name, emoji, role) = match role {
                    Role::User => ("User".to_string(), "👤".to_string(), "user"),
                    Role::Assistant => (speaker.label(), speaker.emoji.clone(), "assistant"),
                    Role::System => ("System".to_string(), "⚙️".to_string(), "system"),
                };
                Some(DisplayMessage {
                    timestamp: *timestamp,
                    role: role.to_string(),
                    sender_name: name,
                    sender_emoji: emoji,
                    content: content.clone(),
                    kind: "message".to_string(),
                })
            }
            Event::SessionStart {
                version,
                cwd,
                timestamp,
            } => Some(DisplayMessage {
                timestamp: *timestamp,
                role: "system".to_string(),
                sender_name: "System".to_string(),
                sender_emoji: "🚀".to_string(),
                content: format!(
                    "Session started (version: {}, cwd: {})",
                    version.as_deref().unwrap_or("N/A"),
                    cwd.as_deref().unwrap_or("N/A")
                ),
                kind: "session".to_string(),
            }),
            Event::ModelChange {
                provider,
                model_id,
                timestamp,
            } => Some(DisplayMessage {
                timestamp: *timestamp,
                role: "system".to_string(),
                sender_name: "System".to_string(),
                sender_emoji: "🔄".to_string(),
                content: format!("Switched model: {}/{}", provider, model_id),
                kind: "model_change".to_string(),
            }),
            Event::ModelSnapshot { .. } | Event::Unknown { .. } => None,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentModelSettings {
    pub system_prompt: Option<String>,
    pub temperature: Option<serde_json::Value>,
    pub max_tokens: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDetails {
    pub id: String,
    pub name: String,
    pub emoji: String,
    pub role: String,
    pub model: Option<String>,
    pub workspace: Option<String>,
    pub subagents: Vec<String>,
    pub status: AgentStatus,
    pub session_count: u32,
    pub total_messages: usize,
    pub last_activity: Option<DateTime<Utc>>,
    pub sessions: Vec<SessionSummary>,
    pub discovered: bool,
    pub config: AgentModelSettings,
}

/// First value any source provides, in source order
fn first_of<T>(
    sources: &[Option<&AgentConfig>],
    field: impl Fn(&AgentConfig) -> Option<T>,
) -> Option<T> {
    sources.iter().flatten().find_map(|a| field(*a))
}

/// Registry entry merged with on-disk sessions.
/// Precedence: agent list, then the per-agent configs map, then defaults.
/// Ids from request paths name a single file or directory, never a route
/// out of the sessions tree
fn is_plain_id(id: &str) -> bool {
    !id.is_empty() && !id.contains(['/', '\\']) && !id.contains("..")
}

pub fn agent_details(
    paths: &RuntimePaths,
    config: Option<&RuntimeConfig>,
    agent_id: &str,
) -> Result<AgentDetails, ReaderError> {
    if !is_plain_id(agent_id) {
        return Err(ReaderError::AgentNotFound(agent_id.to_string()));
    }
    let listed = config.and_then(|c| c.find_agent(agent_id));
    if listed.is_none() && !paths.sessions_dir(agent_id).is_dir() {
        return Err(ReaderError::AgentNotFound(agent_id.to_string()));
    }
    let extra = config.and_then(|c| c.extra_agent(agent_id));
    let defaults = config.map(|c| &c.agents.defaults);

    let identity_sources = [listed, extra];
    let all_sources = [listed, extra, defaults];

    let sessions = list_sessions(paths, agent_id)?;
    let mut summaries = Vec::with_capacity(sessions.len());
    let mut total_messages = 0;
    for session in &sessions {
        let message_count = count_lines(session).unwrap_or(0);
        total_messages += message_count;
        summaries.push(SessionSummary {
            id: session.session_id.clone(),
            message_count,
            created_at: session.created_utc(),
            updated_at: session.modified_utc(),
        });
    }
    summaries.truncate(AGENT_DETAIL_SESSIONS);

    let status = agent_status(paths, agent_id);

    Ok(AgentDetails {
        id: agent_id.to_string(),
        name: first_of(&identity_sources, |a| a.identity.name.clone())
            .unwrap_or_else(|| agent_id.to_string()),
        emoji: first_of(&identity_sources, |a| a.identity.emoji.clone())
            .unwrap_or_else(|| "🧩".to_string()),
        role: first_of(&identity_sources, |a| a.identity.role.clone())
            .or_else(|| default_role(agent_id).map(str::to_string))
            .unwrap_or_else(|| "Sub-agent".to_string()),
        model: first_of(&all_sources, |a| a.model.primary.clone()),
        workspace: first_of(&all_sources, |a| a.workspace.clone()),
        subagents: listed
            .map(|a| a.subagents.allow_agents.clone())
            .unwrap_or_default(),
        status: status.status,
        session_count: status.session_count,
        total_messages,
        last_activity: sessions.first().map(|s| s.modified_utc()),
        sessions: summaries,
        discovered: listed.is_none(),
        config: AgentModelSettings {
            system_prompt: first_of(&all_sources, |a| a.system_prompt.clone()),
            temperature: first_of(&all_sources, |a| a.model.temperature.clone()),
            max_tokens: first_of(&all_sources, |a| a.model.max_tokens.clone()),
        },
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetails {
    pub session_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub agent_emoji: String,
    pub agent_role: String,
    pub message_count: usize,
    pub messages: Vec<DisplayMessage>,
}

fn speaker_for(agent_id: &str, agents: &[AgentInfo]) -> Speaker {
    match agents.iter().find(|a| a.agent.id == agent_id) {
        Some(info) => Speaker {
            name: info.agent.name.clone(),
            emoji: info.agent.emoji.clone(),
            role: info.agent.role.clone(),
        },
        None => Speaker {
            name: agent_id.to_string(),
            emoji: "🤖".to_string(),
            role: default_role(agent_id).unwrap_or("Assistant").to_string(),
        },
    }
}

pub fn session_details(
    paths: &RuntimePaths,
    agents: &[AgentInfo],
    agent_id: &str,
    session_id: &str,
) -> Result<SessionDetails, ReaderError> {
    let path = paths.session_file(agent_id, session_id);
    if !is_plain_id(agent_id) || !is_plain_id(session_id) || !path.is_file() {
        return Err(ReaderError::SessionNotFound(
            agent_id.to_string(),
            session_id.to_string(),
        ));
    }

    let speaker = speaker_for(agent_id, agents);
    let events = read_session_events(&path)?;
    let messages = render_transcript(&events, &speaker);

    Ok(SessionDetails {
        session_id: session_id.to_string(),
        agent_id: agent_id.to_string(),
        agent_name: speaker.name,
        agent_emoji: speaker.emoji,
        agent_role: speaker.role,
        message_count: messages.len(),
        messages,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleBreakdown {
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub system_messages: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDetails {
    pub id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub title: String,
    pub status: TaskStatus,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration: String,
    pub duration_ms: i64,
    pub messages: Vec<DisplayMessage>,
    pub summary: RoleBreakdown,
}

/// Look a task up in every agent's sessions, first match wins
pub fn task_details(
    paths: &RuntimePaths,
    agents: &[AgentInfo],
    task_id: &str,
) -> Result<TaskDetails, ReaderError> {
    if !is_plain_id(task_id) {
        return Err(ReaderError::TaskNotFound(task_id.to_string()));
    }
    for agent in agents {
        let path = paths.session_file(&agent.agent.id, task_id);
        let Some(session) = SessionFile::from_path(&agent.agent.id, path) else {
            continue;
        };

        let events = read_session_events(&session.path)?;
        let speaker = speaker_for(&agent.agent.id, agents);
        let messages = render_transcript(&events, &speaker);

        let mut summary = RoleBreakdown::default();
        for m in &messages {
            match m.role.as_str() {
                "user" => summary.user_messages += 1,
                "assistant" => summary.assistant_messages += 1,
                _ => summary.system_messages += 1,
            }
        }

        let created_at = session.created_utc();
        let completed_at = session.modified_utc();
        let duration_ms = (completed_at - created_at).num_milliseconds().max(0);

        return Ok(TaskDetails {
            id: task_id.to_string(),
            agent_id: agent.agent.id.clone(),
            agent_name: agent.agent.name.clone(),
            title: task_title(&events),
            status: TaskStatus::Completed,
            message_count: messages.len(),
            created_at,
            completed_at,
            duration: format!("{}m {}s", duration_ms / 60_000, (duration_ms % 60_000) / 1000),
            duration_ms,
            messages,
            summary,
        });
    }

    Err(ReaderError::TaskNotFound(task_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::models::Agent;
    use crate::usage::reader::list_agents;
    use std::fs;
    use tempfile::TempDir;

    fn write_session(paths: &RuntimePaths, agent: &str, id: &str, lines: &[&str]) {
        let dir = paths.sessions_dir(agent);
        fs::create_dir_all(&dir).unwrap();
        fs::write(paths.session_file(agent, id), lines.join("\n") + "\n").unwrap();
    }

    fn agent(id: &str) -> AgentInfo {
        AgentInfo {
            agent: Agent {
                id: id.to_string(),
                name: format!("{} bot", id),
                emoji: "🤖".to_string(),
                role: "Programmer".to_string(),
                ..Default::default()
            },
            model: None,
            status: AgentStatus::Active,
            session_count: 1,
            last_activity: None,
        }
    }

    const SESSION: [&str; 5] = [
        r#"{"type":"session","version":"1.2","cwd":"/w","timestamp":"2024-01-01T10:00:00Z"}"#,
        r#"{"type":"message","timestamp":"2024-01-01T10:00:05Z","message":{"role":"user","content":"```ls```"}}"#,
        r#"{"type":"message","timestamp":"2024-01-01T10:00:10Z","message":{"role":"user","content":"How do I fix the build?"}}"#,
        r#"{"type":"model_change","provider":"openai","modelId":"gpt-4","timestamp":"2024-01-01T10:00:20Z"}"#,
        r#"{"type":"message","timestamp":"2024-01-01T10:01:40Z","message":{"role":"assistant","content":[{"type":"text","text":"Run cargo"}]}}"#,
    ];

    #[test]
    fn test_list_tasks() {
        let tmp = TempDir::new().unwrap();
        let paths = RuntimePaths::new(tmp.path());
        write_session(&paths, "coder", "s1", &SESSION);

        let agents = vec![agent("coder")];
        let now = Utc::now();
        let tasks = list_tasks_at(&paths, &agents, now);
        assert_eq!(tasks.current.len(), 1);
        let task = &tasks.current[0];
        assert_eq!(task.title, "How do I fix the build?");
        assert_eq!(task.message_count, 5);
        assert_eq!(task.agent_name, "coder bot");

        // An hour later the same session is history
        let later = list_tasks_at(&paths, &agents, now + Duration::hours(1));
        assert!(later.current.is_empty());
        assert_eq!(later.history[0].status, TaskStatus::Completed);
    }

    #[test]
    fn test_task_title_falls_back_to_untitled() {
        let events = vec![Event::Message {
            role: Role::Assistant,
            content: "only the agent spoke".to_string(),
            provider: None,
            model: None,
            timestamp: None,
        }];
        assert_eq!(task_title(&events), UNTITLED);
    }

    #[test]
    fn test_duration_from_event_span() {
        let tmp = TempDir::new().unwrap();
        let paths = RuntimePaths::new(tmp.path());
        write_session(&paths, "coder", "s1", &SESSION);

        let sessions = list_sessions(&paths, "coder").unwrap();
        assert_eq!(session_duration_secs(&sessions[0]), Some(100.0));
        assert_eq!(task_durations(&paths, &[agent("coder")]), vec![100.0]);
    }

    #[test]
    fn test_render_transcript() {
        let events: Vec<Event> = SESSION
            .iter()
            .filter_map(|l| crate::usage::reader::parse_line(l))
            .collect();
        let speaker = Speaker {
            name: "Coder".to_string(),
            emoji: "💻".to_string(),
            role: "Programmer".to_string(),
        };
        let messages = render_transcript(&events, &speaker);
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].kind, "session");
        assert_eq!(messages[3].content, "Switched model: openai/gpt-4");
        assert_eq!(messages[4].sender_name, "Coder (Programmer)");
        assert_eq!(messages[4].content, "Run cargo");
    }

    #[test]
    fn test_details_not_found() {
        let tmp = TempDir::new().unwrap();
        let paths = RuntimePaths::new(tmp.path());

        let err = agent_details(&paths, None, "ghost").unwrap_err();
        assert!(matches!(err, ReaderError::AgentNotFound(_)));
        assert!(err.is_not_found());

        let err = session_details(&paths, &[], "ghost", "s1").unwrap_err();
        assert!(matches!(err, ReaderError::SessionNotFound(..)));

        let err = task_details(&paths, &[agent("coder")], "nope").unwrap_err();
        assert!(matches!(err, ReaderError::TaskNotFound(_)));
    }

    #[test]
    fn test_agent_and_task_details() {
        let tmp = TempDir::new().unwrap();
        let paths = RuntimePaths::new(tmp.path());
        write_session(&paths, "coder", "s1", &SESSION);
        fs::write(
            paths.config_file(),
            r#"{"agents": {
                "defaults": {"workspace": "/ws", "model": {"primary": "openai/gpt-4", "temperature": 0.2}},
                "configs": {"coder": {"identity": {"name": "Coder", "role": "Builder"}}}
            }}"#,
        )
        .unwrap();
        let config = crate::usage::config::load_runtime_config(&paths);

        let details = agent_details(&paths, config.as_ref(), "coder").unwrap();
        assert!(details.discovered);
        assert_eq!(details.name, "Coder");
        assert_eq!(details.role, "Builder");
        assert_eq!(details.workspace.as_deref(), Some("/ws"));
        assert_eq!(details.model.as_deref(), Some("openai/gpt-4"));
        assert_eq!(details.total_messages, 5);
        assert_eq!(details.sessions[0].id, "s1");

        let agents = list_agents(&paths, config.as_ref());
        let task = task_details(&paths, &agents, "s1").unwrap();
        assert_eq!(task.agent_id, "coder");
        assert_eq!(task.title, "How do I fix the build?");
        assert_eq!(task.summary.user_messages, 2);
        assert_eq!(task.summary.assistant_messages, 1);
        assert_eq!(task.summary.system_messages, 2);
    }

    #[test]
    fn test_ids_cannot_leave_the_sessions_tree() {
        let tmp = TempDir::new().unwrap();
        let paths = RuntimePaths::new(tmp.path());
        write_session(&paths, "coder", "s1", &SESSION);
        fs::write(tmp.path().join("secret.jsonl"), SESSION.join("\n")).unwrap();
        let agents = vec![agent("coder")];

        let err = session_details(&paths, &agents, "coder", "../../../secret").unwrap_err();
        assert!(matches!(err, ReaderError::SessionNotFound(..)));
        let err = task_details(&paths, &agents, "../../../secret").unwrap_err();
        assert!(matches!(err, ReaderError::TaskNotFound(_)));
        let err = agent_details(&paths, None, "../agents/coder").unwrap_err();
        assert!(matches!(err, ReaderError::AgentNotFound(_)));

        assert!(session_details(&paths, &agents, "coder", "s1").is_ok());
    }

    #[test]
    fn test_message_count_skips_only_invalid_utf8_line() {
        let tmp = TempDir::new().unwrap();
        let paths = RuntimePaths::new(tmp.path());
        fs::create_dir_all(paths.sessions_dir("coder")).unwrap();
        let mut content = Vec::new();
        content.extend_from_slice(SESSION[0].as_bytes());
        content.extend_from_slice(b"\n\xff\xfe\n");
        content.extend_from_slice(SESSION[4].as_bytes());
        content.push(b'\n');
        fs::write(paths.session_file("coder", "s1"), content).unwrap();

        let tasks = list_tasks_at(&paths, &[agent("coder")], Utc::now());
        assert_eq!(tasks.current[0].message_count, 3);
    }
}
