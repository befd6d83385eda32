//! Session log reading, parsing and agent discovery

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Duration, TimeZone, Utc};
use glob::{glob, Pattern};
use log::{debug, warn};

use crate::usage::attribution::latest_model;
use crate::usage::config::{
    default_role, RuntimeConfig, RuntimePaths, DELETED_MARKER, SESSION_EXTENSION,
};
use crate::usage::models::{
    Agent, AgentInfo, AgentStatus, Event, RawLogLine, RawMessage, Role,
};

/// Error type for reader operations
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Directory not found: {0}")]
    DirNotFound(String),
    #[error("Agent not found: {0}")]
    AgentNotFound(String),
    #[error("Session not found: {0}/{1}")]
    SessionNotFound(String, String),
    #[error("Task not found: {0}")]
    TaskNotFound(String),
}

impl ReaderError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ReaderError::DirNotFound(_)
                | ReaderError::AgentNotFound(_)
                | ReaderError::SessionNotFound(..)
                | ReaderError::TaskNotFound(_)
        )
    }
}

/// One session file on disk
#[derive(Debug, Clone)]
pub struct SessionFile {
    pub agent_id: String,
    pub session_id: String,
    pub path: PathBuf,
    pub modified: SystemTime,
    pub created: Option<SystemTime>,
    pub size: u64,
}

impl SessionFile {
    /// Stat a session file. Returns `None` if it vanished or cannot be stat'ed.
    pub fn from_path(agent_id: &str, path: PathBuf) -> Option<Self> {
        let meta = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                debug!("Skipping session {:?}: {}", path, e);
                return None;
            }
        };
        let file_name = path.file_name()?.to_str()?;
        let session_id = file_name
            .strip_suffix(SESSION_EXTENSION)
            .unwrap_or(file_name)
            .to_string();

        Some(Self {
            agent_id: agent_id.to_string(),
            session_id,
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            created: meta.created().ok(),
            size: meta.len(),
            path,
        })
    }

    pub fn modified_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.modified)
    }

    /// Birth time when the filesystem records one, else the modification time
    pub fn created_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.created.unwrap_or(self.modified))
    }
}

/// Whether a file name denotes a live (not soft-deleted) session log
pub fn is_active_session_name(file_name: &str) -> bool {
    file_name.ends_with(SESSION_EXTENSION) && !file_name.contains(DELETED_MARKER)
}

/// List the active session files of one agent. A missing sessions directory
/// is an empty list; an unreadable one is an error.
pub fn list_sessions(paths: &RuntimePaths, agent_id: &str) -> Result<Vec<SessionFile>, ReaderError> {
    let dir = paths.sessions_dir(agent_id);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    // Surface permission errors before globbing, glob swallows them
    fs::read_dir(&dir)?;

    let pattern = format!(
        "{}/*{}",
        Pattern::escape(&dir.to_string_lossy()),
        SESSION_EXTENSION
    );

    let mut sessions: Vec<SessionFile> = glob(&pattern)
        .map(|paths| paths.filter_map(Result::ok).collect::<Vec<_>>())
        .unwrap_or_default()
        .into_iter()
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(is_active_session_name)
                .unwrap_or(false)
        })
        .filter_map(|p| SessionFile::from_path(agent_id, p))
        .collect();

    // Newest first
    sessions.sort_by(|a, b| b.modified.cmp(&a.modified));
    Ok(sessions)
}

/// Lazily parsed events of one session log
pub struct SessionEvents<R> {
    lines: io::Lines<R>,
    line_num: usize,
}

impl<R: BufRead> SessionEvents<R> {
    pub fn from_reader(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_num: 0,
        }
    }
}

impl<R: BufRead> Iterator for SessionEvents<R> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        loop {
            let line = self.lines.next()?;
            self.line_num += 1;

            match line {
                Ok(line) => {
                    if let Some(event) = parse_line(&line) {
                        return Some(event);
                    }
                }
                // The bad line has been consumed, keep going
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    debug!("Skipping non UTF-8 line {}: {}", self.line_num, e);
                }
                Err(e) => {
                    debug!("Stopping read at line {}: {}", self.line_num, e);
                    return None;
                }
            }
        }
    }
}

/// Open a session log for reading from the start. Every call rereads from disk.
pub fn read_session(path: &Path) -> Result<SessionEvents<BufReader<File>>, ReaderError> {
    read_session_from(path, 0)
}

/// Open a session log starting at the first line boundary at or after `offset`
pub fn read_session_from(
    path: &Path,
    offset: u64,
) -> Result<SessionEvents<BufReader<File>>, ReaderError> {
    Ok(SessionEvents::from_reader(open_at_line(path, offset)?))
}

/// Read every parsable event of a session into memory
pub fn read_session_events(path: &Path) -> Result<Vec<Event>, ReaderError> {
    Ok(read_session(path)?.collect())
}

/// Position a reader on the first full line at or after `offset`
fn open_at_line(path: &Path, offset: u64) -> Result<BufReader<File>, ReaderError> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    let offset = offset.min(size);

    if offset == 0 {
        return Ok(BufReader::new(file));
    }

    // Are we already at the start of a line?
    file.seek(SeekFrom::Start(offset - 1))?;
    let mut prev = [0u8; 1];
    file.read_exact(&mut prev)?;

    let mut reader = BufReader::new(file);
    if prev[0] != b'\n' {
        let mut partial = Vec::new();
        reader.read_until(b'\n', &mut partial)?;
    }
    Ok(reader)
}

/// Read the trailing part of a text file as whole lines, at most `max_bytes`
/// from the end. Used for recent-log views on files that grow without bound.
pub fn read_tail(path: &Path, max_bytes: u64) -> Result<Vec<String>, ReaderError> {
    let size = fs::metadata(path)?.len();
    let reader = open_at_line(path, size.saturating_sub(max_bytes))?;

    let mut lines = Vec::new();
    for line in reader.split(b'\n') {
        let line = line?;
        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches('\r');
        if !text.trim().is_empty() {
            lines.push(text.to_string());
        }
    }
    Ok(lines)
}

/// Non-empty lines of a text file. Invalid UTF-8 is replaced, so one bad
/// line never hides the rest of the file.
pub fn text_lines(path: &Path) -> Result<impl Iterator<Item = String>, ReaderError> {
    let reader = BufReader::new(File::open(path)?);
    Ok(reader
        .split(b'\n')
        .map_while(Result::ok)
        .map(|line| String::from_utf8_lossy(&line).trim_end_matches('\r').to_string())
        .filter(|line| !line.trim().is_empty()))
}

/// Estimated bytes per log line when sizing a tail read
pub const TAIL_BYTES_PER_LINE: u64 = 200;

/// Last `count` non-empty lines of a text file, reading only the tail
pub fn read_tail_lines(path: &Path, count: usize) -> Result<Vec<String>, ReaderError> {
    let max_bytes = (count as u64).saturating_mul(TAIL_BYTES_PER_LINE);
    let mut lines = read_tail(path, max_bytes)?;
    if lines.len() > count {
        lines.drain(..lines.len() - count);
    }
    Ok(lines)
}

/// Parse one log line. Lines that are not JSON objects yield `None`; JSON
/// with a shape we do not interpret becomes [`Event::Unknown`].
pub fn parse_line(line: &str) -> Option<Event> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let raw: RawLogLine = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(_) => return None,
    };
    let timestamp = raw.timestamp.as_ref().and_then(parse_timestamp_value);

    let event = match raw.event_type.as_deref() {
        Some("message") => raw
            .message
            .as_ref()
            .and_then(|m| message_event(m, timestamp)),
        Some("model_change") => match (raw.provider, raw.model_id) {
            (Some(provider), Some(model_id)) if !provider.is_empty() && !model_id.is_empty() => {
                Some(Event::ModelChange {
                    provider,
                    model_id,
                    timestamp,
                })
            }
            _ => None,
        },
        Some("custom") if raw.custom_type.as_deref() == Some("model-snapshot") => {
            raw.data.map(|data| Event::ModelSnapshot {
                provider: data.provider,
                model_id: data.model_id,
                timestamp,
            })
        }
        Some("session") => Some(Event::SessionStart {
            version: raw.version,
            cwd: raw.cwd,
            timestamp,
        }),
        _ => None,
    };

    Some(event.unwrap_or_else(|| Event::Unknown {
        raw: line.to_string(),
        timestamp,
    }))
}

fn message_event(message: &RawMessage, timestamp: Option<DateTime<Utc>>) -> Option<Event> {
    let role = Role::parse(message.role.as_deref()?)?;
    Some(Event::Message {
        role,
        content: message
            .content
            .as_ref()
            .map(content_text)
            .unwrap_or_default(),
        provider: message.provider.clone().filter(|s| !s.is_empty()),
        model: message.model.clone().filter(|s| !s.is_empty()),
        timestamp,
    })
}

/// Flatten message content: plain strings pass through, block arrays keep
/// only their `text` blocks joined by newlines.
pub fn content_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(blocks) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Timestamps appear either as ISO strings or as epoch milliseconds
fn parse_timestamp_value(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => parse_timestamp(s),
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Start of a trailing window of `hours`, saturating at the earliest
/// representable instant
pub fn hours_before(now: DateTime<Utc>, hours: u32) -> DateTime<Utc> {
    now.checked_sub_signed(Duration::hours(i64::from(hours)))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Parse ISO timestamp to DateTime<Utc>
pub fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|ndt| ndt.and_utc())
        })
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|ndt| ndt.and_utc())
        })
}

/// Session summary used by agent status
#[derive(Debug, Clone)]
pub struct AgentSessionStatus {
    pub status: AgentStatus,
    pub session_count: u32,
    pub last_activity: Option<DateTime<Utc>>,
    pub current_model: Option<String>,
}

/// Derive an agent's status from its session directory
pub fn agent_status(paths: &RuntimePaths, agent_id: &str) -> AgentSessionStatus {
    let sessions = match list_sessions(paths, agent_id) {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to list sessions for agent {}: {}", agent_id, e);
            return AgentSessionStatus {
                status: AgentStatus::Unknown,
                session_count: 0,
                last_activity: None,
                current_model: None,
            };
        }
    };

    // list_sessions sorts newest first
    let latest = sessions.first();
    let current_model = latest
        .and_then(|s| read_session(&s.path).ok())
        .and_then(|events| latest_model(events))
        .map(|m| m.key());

    AgentSessionStatus {
        status: if sessions.is_empty() {
            AgentStatus::Idle
        } else {
            AgentStatus::Active
        },
        session_count: sessions.len() as u32,
        last_activity: latest.map(|s| s.modified_utc()),
        current_model,
    }
}

/// Union of configured agents and agents discovered on disk.
///
/// Configured agents come first in config order; discovered agents follow,
/// sorted by id, and are only included when they have at least one session.
pub fn list_agents(paths: &RuntimePaths, config: Option<&RuntimeConfig>) -> Vec<AgentInfo> {
    let mut agents = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    if let Some(config) = config {
        let defaults = &config.agents.defaults;
        for agent_config in &config.agents.list {
            let Some(id) = agent_config.id.clone() else {
                continue;
            };
            if !seen.insert(id.clone()) {
                continue;
            }

            let default_model = agent_config
                .model
                .primary
                .clone()
                .or_else(|| defaults.model.primary.clone());
            let status = agent_status(paths, &id);

            agents.push(AgentInfo {
                agent: Agent {
                    name: agent_config.identity.name.clone().unwrap_or_else(|| id.clone()),
                    emoji: agent_config
                        .identity
                        .emoji
                        .clone()
                        .unwrap_or_else(|| "🤖".to_string()),
                    role: agent_config
                        .identity
                        .role
                        .clone()
                        .or_else(|| default_role(&id).map(str::to_string))
                        .unwrap_or_else(|| "General Assistant".to_string()),
                    default_model: default_model.clone(),
                    workspace: agent_config
                        .workspace
                        .clone()
                        .or_else(|| defaults.workspace.clone()),
                    subagent_ids: agent_config.subagents.allow_agents.clone(),
                    discovered: false,
                    id,
                },
                model: status.current_model.or(default_model),
                status: status.status,
                session_count: status.session_count,
                last_activity: status.last_activity.map(|t| t.to_rfc3339()),
            });
        }
    }

    let agents_dir = paths.agents_dir();
    let mut discovered: Vec<String> = match fs::read_dir(&agents_dir) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|id| !seen.contains(id))
            .filter(|id| paths.sessions_dir(id).is_dir())
            .collect(),
        Err(e) => {
            debug!("Agents directory {:?} not readable: {}", agents_dir, e);
            Vec::new()
        }
    };
    discovered.sort();

    for id in discovered {
        let status = agent_status(paths, &id);
        // Skip empty shells
        if status.session_count == 0 {
            continue;
        }

        let extra = config.and_then(|c| c.extra_agent(&id)).cloned().unwrap_or_default();
        let default_model = extra.model.primary.clone();

        agents.push(AgentInfo {
            agent: Agent {
                name: extra.identity.name.clone().unwrap_or_else(|| id.clone()),
                emoji: extra.identity.emoji.clone().unwrap_or_else(|| "🧩".to_string()),
                role: extra
                    .identity
                    .role
                    .clone()
                    .or_else(|| default_role(&id).map(str::to_string))
                    .unwrap_or_else(|| "Sub-agent".to_string()),
                default_model: default_model.clone(),
                workspace: extra.workspace.clone(),
                subagent_ids: Vec::new(),
                discovered: true,
                id,
            },
            model: status.current_model.or(default_model),
            status: status.status,
            session_count: status.session_count,
            last_activity: status.last_activity.map(|t| t.to_rfc3339()),
        });
    }

    agents
}

/// Depth-first walk of subordinate agents starting at `root` (excluded).
/// Subagent lists may form cycles; each agent is visited once.
pub fn subagent_tree<'a>(agents: &'a [AgentInfo], root: &str) -> Vec<&'a AgentInfo> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut out = Vec::new();
    let mut stack: Vec<&str> = vec![root];
    visited.insert(root);

    while let Some(id) = stack.pop() {
        let Some(agent) = agents.iter().find(|a| a.agent.id == id) else {
            continue;
        };
        if id != root {
            out.push(agent);
        }
        // Reverse so the first listed child is visited first
        for child in agent.agent.subagent_ids.iter().rev() {
            if visited.insert(child.as_str()) {
                stack.push(child.as_str());
            }
        }
    }

    out
}
