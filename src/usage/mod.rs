//! Agent runtime dashboard - session scanning, aggregation and history

/// Lazily compiled regex accessor
macro_rules! static_regex {
    ($name:ident, $pattern:expr) => {
        fn $name() -> &'static ::regex::Regex {
            static RE: ::std::sync::OnceLock<::regex::Regex> = ::std::sync::OnceLock::new();
            RE.get_or_init(|| ::regex::Regex::new($pattern).expect("valid regex"))
        }
    };
}

pub mod alerts;
pub mod attribution;
pub mod background;
pub mod cache;
pub mod config;
pub mod history;
pub mod logs;
pub mod models;
pub mod reader;
pub mod stats;
pub mod system;
pub mod tasks;
pub mod title;

pub use alerts::{AlertEvaluator, AlertOutcome, AlertRule, MetricsSnapshot};
pub use attribution::ModelAttributionTracker;
pub use background::start_background_tasks;
pub use cache::CacheManager;
pub use config::*;
pub use history::HistoryStore;
pub use models::*;
pub use reader::*;
pub use stats::UsageAggregator;
pub use title::extract_title;
