//! Runtime error log: recent tail and keyword analysis

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::usage::config::RuntimePaths;
use crate::usage::reader::{
    hours_before, parse_timestamp, read_tail_lines, text_lines, ReaderError,
};

static_regex!(iso_millis_re, r"(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d{3}Z)");
static_regex!(hour_re, r"T(\d{2}):");

/// Keywords counted as error patterns
const ERROR_KEYWORDS: [&str; 9] = [
    "timeout",
    "connection",
    "failed",
    "error",
    "exception",
    "not found",
    "permission",
    "unauthorized",
    "invalid",
];

const MAX_PATTERNS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
}

impl LogLevel {
    /// Substring classification, error wins over warn
    pub fn classify(line: &str) -> Self {
        let lower = line.to_lowercase();
        if lower.contains("error") {
            LogLevel::Error
        } else if lower.contains("warn") {
            LogLevel::Warn
        } else {
            LogLevel::Info
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
}

/// First ISO timestamp with millisecond precision in a log line
pub fn extract_timestamp(line: &str) -> Option<String> {
    iso_millis_re()
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn to_entry(line: String) -> LogEntry {
    LogEntry {
        timestamp: extract_timestamp(&line).unwrap_or_else(|| Utc::now().to_rfc3339()),
        level: LogLevel::classify(&line),
        message: line,
    }
}

/// Last `count` lines of the runtime log. A missing log is an empty list.
pub fn recent_logs(paths: &RuntimePaths, count: usize) -> Vec<LogEntry> {
    let path = paths.gateway_log();
    if !path.exists() {
        return Vec::new();
    }
    match read_tail_lines(&path, count) {
        Ok(lines) => lines.into_iter().map(to_entry).collect(),
        Err(e) => {
            log::warn!("Failed to read log tail {:?}: {}", path, e);
            Vec::new()
        }
    }
}

/// Share of error lines, in percent
pub fn error_rate(entries: &[LogEntry]) -> f64 {
    if entries.is_empty() {
        return 0.0;
    }
    let errors = entries.iter().filter(|e| e.level == LogLevel::Error).count();
    errors as f64 / entries.len() as f64 * 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogLine {
    pub line: String,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatternCount {
    pub pattern: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogAnalysis {
    pub total: usize,
    pub by_level: BTreeMap<String, u64>,
    pub by_hour: BTreeMap<String, u64>,
    pub errors: Vec<LogLine>,
    pub warnings: Vec<LogLine>,
    pub patterns: Vec<PatternCount>,
}

/// Filters for [`analyze_logs`]
#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    pub hours: u32,
    /// `error`, `warn` or `all`
    pub level: Option<String>,
    pub keyword: Option<String>,
}

/// Analyze the whole runtime log. A missing log yields an empty analysis.
pub fn analyze_logs(paths: &RuntimePaths, options: &AnalyzeOptions) -> Result<LogAnalysis, ReaderError> {
    let path = paths.gateway_log();
    if !path.exists() {
        return Ok(LogAnalysis::default());
    }

    Ok(analyze_lines(text_lines(&path)?, options, Utc::now()))
}

/// Core of [`analyze_logs`] over any line source
pub fn analyze_lines<I>(lines: I, options: &AnalyzeOptions, now: DateTime<Utc>) -> LogAnalysis
where
    I: IntoIterator<Item = String>,
{
    let cutoff = hours_before(now, options.hours);
    let mut analysis = LogAnalysis::default();

    for line in lines {
        let timestamp = extract_timestamp(&line);
        // Lines without a timestamp are always included
        if let Some(ts) = timestamp.as_deref().and_then(parse_timestamp) {
            if ts < cutoff {
                continue;
            }
        }

        analysis.total += 1;
        let level = LogLevel::classify(&line);
        *analysis.by_level.entry(level.as_str().to_string()).or_insert(0) += 1;

        if let Some(hour) = hour_re().captures(&line).and_then(|c| c.get(1)) {
            *analysis.by_hour.entry(hour.as_str().to_string()).or_insert(0) += 1;
        }

        match level {
            LogLevel::Error => analysis.errors.push(LogLine { line, timestamp }),
            LogLevel::Warn => analysis.warnings.push(LogLine { line, timestamp }),
            LogLevel::Info => {}
        }
    }

    analysis.patterns = error_patterns(&analysis.errors);

    match options.level.as_deref() {
        Some("error") => analysis.warnings.clear(),
        Some("warn") => analysis.errors.clear(),
        _ => {}
    }

    if let Some(keyword) = options.keyword.as_deref().filter(|k| !k.is_empty()) {
        let keyword = keyword.to_lowercase();
        analysis.errors.retain(|e| e.line.to_lowercase().contains(&keyword));
        analysis.warnings.retain(|w| w.line.to_lowercase().contains(&keyword));
    }

    analysis
}

/// Keyword frequency over error lines, top 10
fn error_patterns(errors: &[LogLine]) -> Vec<PatternCount> {
    let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
    for error in errors {
        let lower = error.line.to_lowercase();
        for keyword in ERROR_KEYWORDS {
            if lower.contains(keyword) {
                *counts.entry(keyword).or_insert(0) += 1;
            }
        }
    }

    let mut patterns: Vec<PatternCount> = counts
        .into_iter()
        .map(|(pattern, count)| PatternCount {
            pattern: pattern.to_string(),
            count,
        })
        .collect();
    // Stable sort, ties stay alphabetical
    patterns.sort_by(|a, b| b.count.cmp(&a.count));
    patterns.truncate(MAX_PATTERNS);
    patterns
}
