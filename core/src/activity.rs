//! Activity log: every connection, sensor, user, system and emergency event
//! worth keeping, with filtering, stats and CSV/JSON export.

use crate::event::{EventBus, EventPayload};
use crate::log::PersistedLog;
use crate::storage::KeyValueStore;
use crate::util::gen_id;
use crate::Result;
use chrono::{DateTime, Duration, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const ACTIVITY_LOG_KEY: &str = "sos.activity";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityCategory {
    Connection,
    Sensor,
    User,
    System,
    Error,
    Warning,
    Emergency,
}

impl ActivityCategory {
    pub const ALL: [ActivityCategory; 7] = [
        ActivityCategory::Connection,
        ActivityCategory::Sensor,
        ActivityCategory::User,
        ActivityCategory::System,
        ActivityCategory::Error,
        ActivityCategory::Warning,
        ActivityCategory::Emergency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityCategory::Connection => "connection",
            ActivityCategory::Sensor => "sensor",
            ActivityCategory::User => "user",
            ActivityCategory::System => "system",
            ActivityCategory::Error => "error",
            ActivityCategory::Warning => "warning",
            ActivityCategory::Emergency => "emergency",
        }
    }

    /// Unknown names fall back to `System`.
    pub fn parse(name: &str) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == name.to_lowercase())
            .unwrap_or(ActivityCategory::System)
    }
}

impl fmt::Display for ActivityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl ActivityLevel {
    pub const ALL: [ActivityLevel; 4] = [
        ActivityLevel::Info,
        ActivityLevel::Warning,
        ActivityLevel::Error,
        ActivityLevel::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityLevel::Info => "info",
            ActivityLevel::Warning => "warning",
            ActivityLevel::Error => "error",
            ActivityLevel::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: String,
    pub category: ActivityCategory,
    pub action: String,
    pub details: Value,
    pub level: ActivityLevel,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
}

#[derive(Clone, Debug)]
pub struct ActivityConfig {
    pub max_logs: usize,
    /// Newest entries written to storage.
    pub persist_window: usize,
    pub retention_days: i64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            max_logs: 1000,
            persist_window: 500,
            retention_days: std::env::var("SOS_LOG_RETENTION_DAYS")
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(30),
        }
    }
}

/// Filters for [`ActivityLog::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub category: Option<ActivityCategory>,
    pub level: Option<ActivityLevel>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub search: Option<String>,
    /// Defaults to 100.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityStats {
    pub total: usize,
    pub by_category: BTreeMap<ActivityCategory, usize>,
    pub by_level: BTreeMap<ActivityLevel, usize>,
    pub today: usize,
    pub last_hour: usize,
}

pub struct ActivityLog {
    log: PersistedLog<ActivityEntry>,
    cfg: ActivityConfig,
    session_id: String,
    bus: Option<Arc<EventBus>>,
    forward: Option<mpsc::UnboundedSender<ActivityEntry>>,
}

impl ActivityLog {
    /// Load persisted entries and drop those past the retention period.
    pub fn load(
        store: Arc<dyn KeyValueStore>,
        cfg: ActivityConfig,
        bus: Option<Arc<EventBus>>,
    ) -> Self {
        let log = PersistedLog::load(store, ACTIVITY_LOG_KEY, cfg.max_logs)
            .with_persist_window(cfg.persist_window);
        let mut this = Self {
            log,
            cfg,
            session_id: gen_id("session"),
            bus,
            forward: None,
        };
        this.clean_old_logs(Utc::now());
        this
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn len(&self) -> usize {
        self.log.log().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.log().is_empty()
    }

    pub fn log(
        &mut self,
        category: ActivityCategory,
        action: &str,
        details: Value,
        level: ActivityLevel,
    ) -> ActivityEntry {
        let entry = ActivityEntry {
            id: gen_id("log"),
            category,
            action: action.to_string(),
            details,
            level,
            timestamp: Utc::now(),
            session_id: self.session_id.clone(),
        };
        self.record(entry.clone());
        entry
    }

    /// Append an already-built entry.
    pub fn record(&mut self, entry: ActivityEntry) {
        match entry.level {
            ActivityLevel::Error | ActivityLevel::Critical => {
                error!(target: "activity", category = %entry.category, details = %entry.details, "{}", entry.action)
            }
            ActivityLevel::Warning => {
                warn!(target: "activity", category = %entry.category, details = %entry.details, "{}", entry.action)
            }
            ActivityLevel::Info => {
                debug!(target: "activity", category = %entry.category, details = %entry.details, "{}", entry.action)
            }
        }

        self.log.push(entry.clone());

        if let Some(tx) = self.forwarder() {
            let _ = tx.send(entry);
        }
    }

    /// Single task that publishes entries in the order they were logged.
    /// Outside a runtime there is nobody to deliver to.
    fn forwarder(&mut self) -> Option<&mpsc::UnboundedSender<ActivityEntry>> {
        if self.forward.as_ref().map_or(true, |tx| tx.is_closed()) {
            let bus = self.bus.clone()?;
            let handle = Handle::try_current().ok()?;
            let (tx, mut rx) = mpsc::unbounded_channel();
            handle.spawn(async move {
                while let Some(entry) = rx.recv().await {
                    bus.emit("activity", EventPayload::ActivityLogged(entry)).await;
                }
            });
            self.forward = Some(tx);
        }
        self.forward.as_ref()
    }

    pub fn log_connection(&mut self, action: &str, details: Value) -> ActivityEntry {
        self.log(ActivityCategory::Connection, action, details, ActivityLevel::Info)
    }

    pub fn log_sensor(&mut self, action: &str, details: Value) -> ActivityEntry {
        self.log(ActivityCategory::Sensor, action, details, ActivityLevel::Info)
    }

    pub fn log_user(&mut self, action: &str, details: Value) -> ActivityEntry {
        self.log(ActivityCategory::User, action, details, ActivityLevel::Info)
    }

    pub fn log_system(&mut self, action: &str, details: Value) -> ActivityEntry {
        self.log(ActivityCategory::System, action, details, ActivityLevel::Info)
    }

    pub fn log_error(&mut self, action: &str, details: Value) -> ActivityEntry {
        self.log(ActivityCategory::Error, action, details, ActivityLevel::Error)
    }

    pub fn log_warning(&mut self, action: &str, details: Value) -> ActivityEntry {
        self.log(ActivityCategory::Warning, action, details, ActivityLevel::Warning)
    }

    pub fn log_emergency(&mut self, action: &str, details: Value) -> ActivityEntry {
        self.log(ActivityCategory::Emergency, action, details, ActivityLevel::Critical)
    }

    /// Matching entries, newest first.
    pub fn query(&self, q: &LogQuery) -> Vec<ActivityEntry> {
        let search = q.search.as_ref().map(|s| s.to_lowercase());
        let limit = q.limit.unwrap_or(100);

        self.log
            .log()
            .iter()
            .rev()
            .filter(|e| q.category.map_or(true, |c| e.category == c))
            .filter(|e| q.level.map_or(true, |l| e.level == l))
            .filter(|e| q.start.map_or(true, |s| e.timestamp >= s))
            .filter(|e| q.end.map_or(true, |end| e.timestamp <= end))
            .filter(|e| match &search {
                Some(s) => {
                    e.action.to_lowercase().contains(s)
                        || e.details.to_string().to_lowercase().contains(s)
                }
                None => true,
            })
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn by_category(&self, category: ActivityCategory, limit: usize) -> Vec<ActivityEntry> {
        self.query(&LogQuery {
            category: Some(category),
            limit: Some(limit),
            ..Default::default()
        })
    }

    pub fn recent_errors(&self, limit: usize) -> Vec<ActivityEntry> {
        self.query(&LogQuery {
            level: Some(ActivityLevel::Error),
            limit: Some(limit),
            ..Default::default()
        })
    }

    /// Entries since local midnight.
    pub fn todays_logs(&self) -> Vec<ActivityEntry> {
        self.query(&LogQuery {
            start: Some(local_midnight(Local::now())),
            ..Default::default()
        })
    }

    pub fn stats(&self, now: DateTime<Utc>) -> ActivityStats {
        let mut stats = ActivityStats {
            total: self.log.log().len(),
            ..Default::default()
        };
        for c in ActivityCategory::ALL {
            stats.by_category.insert(c, 0);
        }
        for l in ActivityLevel::ALL {
            stats.by_level.insert(l, 0);
        }

        let hour_ago = now - Duration::hours(1);
        let today_start = local_midnight(now.with_timezone(&Local));

        for e in self.log.log().iter() {
            *stats.by_category.entry(e.category).or_default() += 1;
            *stats.by_level.entry(e.level).or_default() += 1;
            if e.timestamp >= today_start {
                stats.today += 1;
            }
            if e.timestamp >= hour_ago {
                stats.last_hour += 1;
            }
        }
        stats
    }

    /// Drop entries older than the retention period. Returns how many went.
    pub fn clean_old_logs(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::days(self.cfg.retention_days);
        let before = self.log.log().len();
        self.log.log_mut().retain(|e| e.timestamp >= cutoff);
        let deleted = before - self.log.log().len();
        if deleted > 0 {
            self.log.save();
            info!(target: "activity", deleted, "Cleaned old logs");
        }
        deleted
    }

    pub fn set_retention_days(&mut self, days: i64) {
        self.cfg.retention_days = days;
        self.clean_old_logs(Utc::now());
    }

    /// Clear everything, then record that it happened.
    pub fn clear(&mut self) {
        self.log.clear();
        let cleared_at = Utc::now().to_rfc3339();
        self.log_system("Logs cleared", serde_json::json!({ "cleared_at": cleared_at }));
    }

    /// CSV of the matching entries, newest first. `None` when nothing matches.
    pub fn export_csv(&self, q: &LogQuery) -> Option<String> {
        let mut q = q.clone();
        q.limit = Some(q.limit.unwrap_or(self.cfg.max_logs));
        let rows = self.query(&q);
        if rows.is_empty() {
            warn!(target: "activity", "No logs to export");
            return None;
        }

        let mut out = String::from("Timestamp,Category,Level,Action,Details,Session ID");
        for e in rows {
            let cells = [
                e.timestamp.to_rfc3339(),
                e.category.as_str().to_string(),
                e.level.as_str().to_string(),
                e.action.clone(),
                e.details.to_string(),
                e.session_id.clone(),
            ];
            out.push('\n');
            let line: Vec<String> = cells.iter().map(|c| csv_cell(c)).collect();
            out.push_str(&line.join(","));
        }
        Some(out)
    }

    /// JSON array of the matching entries, oldest first, as
    /// [`import_json`](Self::import_json) expects it.
    pub fn export_json(&self, q: &LogQuery) -> Result<String> {
        let mut q = q.clone();
        q.limit = Some(q.limit.unwrap_or(self.cfg.max_logs));
        let mut rows = self.query(&q);
        rows.reverse();
        Ok(serde_json::to_string_pretty(&rows)?)
    }

    /// Replace the log with an exported JSON array and persist it.
    pub fn import_json(&mut self, json: &str) -> Result<usize> {
        let count = self.log.import_json(json)?;
        info!(target: "activity", count, "Imported activity log");
        Ok(count)
    }
}

/// Quote a CSV cell, doubling inner quotes.
pub(crate) fn csv_cell(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

fn local_midnight<Tz: TimeZone>(now: DateTime<Tz>) -> DateTime<Utc> {
    let Some(midnight) = now.date_naive().and_hms_opt(0, 0, 0) else {
        return now.with_timezone(&Utc);
    };
    now.timezone()
        .from_local_datetime(&midnight)
        .earliest()
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|| now.with_timezone(&Utc))
}

/// Default export file name, e.g. `activity-log-2024-05-01.csv`.
pub fn export_filename(extension: &str, now: DateTime<Utc>) -> String {
    format!("activity-log-{}.{}", now.format("%Y-%m-%d"), extension)
}
