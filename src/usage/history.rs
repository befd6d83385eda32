//! Flat-file history series with retention pruning
//!
//! Each series is one JSON file `{data, lastUpdate}` in the dashboard data
//! directory, rewritten in full on every append. Files that are missing or
//! unreadable read as empty series.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Local, Timelike, Utc};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::usage::models::{HealthRecord, MetricRecord, ModelStatsRecord, TaskStatsRecord};
use crate::usage::reader::hours_before;

pub const METRICS_SERIES: &str = "metrics-history.json";
pub const HEALTH_SERIES: &str = "health-history.json";
pub const TASKS_SERIES: &str = "tasks-stats.json";
pub const MODELS_SERIES: &str = "models-stats.json";
pub const CHANNELS_SERIES: &str = "channels-stats.json";

/// Error type for history persistence
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Records that carry their own sample time
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

impl Timestamped for MetricRecord {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Timestamped for HealthRecord {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Timestamped for TaskStatsRecord {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Timestamped for ModelStatsRecord {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// On-disk shape of a series file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Series<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
}

impl<T> Default for Series<T> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            last_update: None,
        }
    }
}

/// Message counts of one channel on one day
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelDayStats {
    #[serde(default)]
    pub total: u64,
    /// Keyed by local hour, `"H:00"`
    #[serde(default)]
    pub hourly: BTreeMap<String, u64>,
}

/// Channel counts bucketed by UTC day, then channel name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSeries {
    #[serde(default)]
    pub data: BTreeMap<String, BTreeMap<String, ChannelDayStats>>,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
}

/// Append-and-prune store for the dashboard's history series
#[derive(Debug)]
pub struct HistoryStore {
    dir: PathBuf,
    retention: Duration,
    // Appends are read-modify-write
    write_lock: Mutex<()>,
}

impl HistoryStore {
    pub fn new(dir: impl Into<PathBuf>, retention_days: u32) -> Self {
        Self {
            dir: dir.into(),
            retention: Duration::days(i64::from(retention_days)),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn series_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Read a JSON file, treating absence or corruption as "no data"
    fn load_file<T: DeserializeOwned + Default>(&self, name: &str) -> T {
        let path = self.series_path(name);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                debug!("History file {:?} not readable: {}", path, e);
                return T::default();
            }
        };
        match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(e) => {
                warn!("Ignoring corrupt history file {:?}: {}", path, e);
                T::default()
            }
        }
    }

    /// Write through a temp file so readers never see a torn file
    fn save_file<T: Serialize>(&self, name: &str, value: &T) -> Result<(), HistoryError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.series_path(name);
        let tmp = self.dir.join(format!(".{}.tmp", name));
        fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Load a whole series
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Series<T> {
        self.load_file(name)
    }

    pub fn append<T>(&self, name: &str, record: T) -> Result<(), HistoryError>
    where
        T: Timestamped + Serialize + DeserializeOwned,
    {
        self.append_at(name, record, Utc::now())
    }

    /// Add a record, drop records older than the retention window, persist
    pub fn append_at<T>(&self, name: &str, record: T, now: DateTime<Utc>) -> Result<(), HistoryError>
    where
        T: Timestamped + Serialize + DeserializeOwned,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut series: Series<T> = self.load(name);
        series.data.push(record);

        let cutoff = now
            .checked_sub_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let before = series.data.len();
        series.data.retain(|r| r.timestamp() >= cutoff);
        if series.data.len() < before {
            debug!("Pruned {} old records from {}", before - series.data.len(), name);
        }

        series.last_update = Some(now);
        self.save_file(name, &series)
    }

    pub fn read<T>(&self, name: &str, since_hours: u32) -> Vec<T>
    where
        T: Timestamped + DeserializeOwned,
    {
        self.read_at(name, since_hours, Utc::now())
    }

    /// Records within the trailing `since_hours` window
    pub fn read_at<T>(&self, name: &str, since_hours: u32, now: DateTime<Utc>) -> Vec<T>
    where
        T: Timestamped + DeserializeOwned,
    {
        let cutoff = hours_before(now, since_hours);
        let series: Series<T> = self.load(name);
        series
            .data
            .into_iter()
            .filter(|r| r.timestamp() >= cutoff)
            .collect()
    }

    /// Last `count` records regardless of age
    pub fn latest<T: DeserializeOwned>(&self, name: &str, count: usize) -> Vec<T> {
        let mut data = self.load::<T>(name).data;
        if data.len() > count {
            data.drain(..data.len() - count);
        }
        data
    }

    pub fn record_channel_counts(&self, counts: &[(String, u64)]) -> Result<(), HistoryError> {
        self.record_channel_counts_at(counts, Utc::now())
    }

    /// Add message counts to today's bucket for each channel, then drop days
    /// past the retention window
    pub fn record_channel_counts_at(
        &self,
        counts: &[(String, u64)],
        now: DateTime<Utc>,
    ) -> Result<(), HistoryError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut series: ChannelSeries = self.load_file(CHANNELS_SERIES);
        let day_key = now.format("%Y-%m-%d").to_string();
        let hour_key = format!("{}:00", now.with_timezone(&Local).hour());

        let day = series.data.entry(day_key).or_default();
        for (channel, count) in counts {
            let stats = day.entry(channel.clone()).or_default();
            stats.total += count;
            *stats.hourly.entry(hour_key.clone()).or_insert(0) += count;
        }

        let oldest_kept = (now - self.retention).format("%Y-%m-%d").to_string();
        series.data.retain(|day, _| *day >= oldest_kept);

        series.last_update = Some(now);
        self.save_file(CHANNELS_SERIES, &series)
    }

    pub fn channel_series(&self) -> ChannelSeries {
        self.load_file(CHANNELS_SERIES)
    }
}

/// Chart label for a sample time, local `HH:MM`
fn time_label(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%H:%M").to_string()
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsHistoryView {
    pub labels: Vec<String>,
    pub cpu: Vec<f64>,
    pub memory: Vec<f64>,
}

pub fn metrics_history(store: &HistoryStore, hours: u32) -> MetricsHistoryView {
    let records: Vec<MetricRecord> = store.read(METRICS_SERIES, hours);
    MetricsHistoryView {
        labels: records.iter().map(|r| time_label(r.timestamp)).collect(),
        cpu: records.iter().map(|r| r.cpu).collect(),
        memory: records.iter().map(|r| r.memory).collect(),
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthHistoryView {
    pub labels: Vec<String>,
    pub scores: Vec<u32>,
    pub statuses: Vec<String>,
}

pub fn health_history(store: &HistoryStore, hours: u32) -> HealthHistoryView {
    let records: Vec<HealthRecord> = store.read(HEALTH_SERIES, hours);
    HealthHistoryView {
        labels: records.iter().map(|r| time_label(r.timestamp)).collect(),
        scores: records.iter().map(|r| r.score).collect(),
        statuses: records
            .iter()
            .map(|r| {
                if r.status.is_empty() {
                    "unknown".to_string()
                } else {
                    r.status.clone()
                }
            })
            .collect(),
    }
}

/// Window for channel statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRange {
    Today,
    Week,
    Month,
}

impl ChannelRange {
    /// Unrecognized ranges mean today
    pub fn parse(value: &str) -> Self {
        match value {
            "week" => ChannelRange::Week,
            "month" => ChannelRange::Month,
            _ => ChannelRange::Today,
        }
    }

    fn days(self) -> i64 {
        match self {
            ChannelRange::Today => 1,
            ChannelRange::Week => 7,
            ChannelRange::Month => 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HourCount {
    pub hour: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChannelStatsView {
    pub labels: Vec<String>,
    pub data: Vec<u64>,
    /// Only filled for a single day
    pub hourly: BTreeMap<String, Vec<HourCount>>,
}

pub fn channel_stats(store: &HistoryStore, range: ChannelRange) -> ChannelStatsView {
    channel_stats_at(store, range, Utc::now())
}

pub fn channel_stats_at(
    store: &HistoryStore,
    range: ChannelRange,
    now: DateTime<Utc>,
) -> ChannelStatsView {
    let series = store.channel_series();

    let mut totals: BTreeMap<String, u64> = BTreeMap::new();
    let mut hourly: BTreeMap<String, Vec<HourCount>> = BTreeMap::new();

    for offset in 0..range.days() {
        let key = (now - Duration::days(offset)).format("%Y-%m-%d").to_string();
        let Some(day) = series.data.get(&key) else {
            continue;
        };
        for (channel, stats) in day {
            *totals.entry(channel.clone()).or_insert(0) += stats.total;
            if range == ChannelRange::Today {
                let mut hours: Vec<HourCount> = stats
                    .hourly
                    .iter()
                    .map(|(hour, count)| HourCount {
                        hour: hour.clone(),
                        count: *count,
                    })
                    .collect();
                hours.sort_by_key(|h| hour_of(&h.hour));
                hourly.insert(channel.clone(), hours);
            }
        }
    }

    ChannelStatsView {
        labels: totals.keys().cloned().collect(),
        data: totals.values().copied().collect(),
        hourly,
    }
}

fn hour_of(key: &str) -> u32 {
    key.split(':').next().and_then(|h| h.parse().ok()).unwrap_or(0)
}

/// Duration histogram bins in seconds, upper bound exclusive
const DURATION_BINS: [(&str, f64, f64); 5] = [
    ("0-10s", 0.0, 10.0),
    ("10-30s", 10.0, 30.0),
    ("30-60s", 30.0, 60.0),
    ("60-120s", 60.0, 120.0),
    ("120s+", 120.0, f64::INFINITY),
];

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskStatsView {
    pub labels: Vec<String>,
    pub data: Vec<u64>,
    pub total: usize,
    pub average: f64,
}

/// Duration distribution over the last 10 samples
pub fn tasks_stats(store: &HistoryStore) -> TaskStatsView {
    let records: Vec<TaskStatsRecord> = store.latest(TASKS_SERIES, 10);
    let times: Vec<f64> = records
        .into_iter()
        .flat_map(|r| r.execution_times)
        .collect();

    let mut data = vec![0u64; DURATION_BINS.len()];
    for time in &times {
        if let Some(i) = DURATION_BINS
            .iter()
            .position(|(_, min, max)| *time >= *min && *time < *max)
        {
            data[i] += 1;
        }
    }

    let average = if times.is_empty() {
        0.0
    } else {
        round_to(times.iter().sum::<f64>() / times.len() as f64, 2)
    };

    TaskStatsView {
        labels: DURATION_BINS.iter().map(|(l, _, _)| l.to_string()).collect(),
        data,
        total: times.len(),
        average,
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelShare {
    pub name: String,
    pub provider: String,
    pub count: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModelsStatsView {
    pub labels: Vec<String>,
    pub data: Vec<u64>,
    pub details: Vec<ModelShare>,
}

/// Model usage summed over the last 30 samples
pub fn models_stats(store: &HistoryStore) -> ModelsStatsView {
    let records: Vec<ModelStatsRecord> = store.latest(MODELS_SERIES, 30);

    let mut merged: HashMap<String, ModelShare> = HashMap::new();
    for record in records {
        for (key, usage) in record.usage {
            let share = merged.entry(key).or_insert_with(|| ModelShare {
                name: usage.model_name.clone(),
                provider: usage.provider.clone(),
                count: 0,
                percentage: 0.0,
            });
            share.count += usage.count;
        }
    }

    let total: u64 = merged.values().map(|m| m.count).sum();
    let mut details: Vec<ModelShare> = merged
        .into_values()
        .map(|mut m| {
            m.percentage = if total > 0 {
                round_to(m.count as f64 / total as f64 * 100.0, 1)
            } else {
                0.0
            };
            m
        })
        .collect();
    details.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));

    ModelsStatsView {
        labels: details.iter().map(|m| m.name.clone()).collect(),
        data: details.iter().map(|m| m.count).collect(),
        details,
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
