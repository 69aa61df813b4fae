//! Sensor readings pulled out of the serial stream, with range queries,
//! summary statistics and export.

use crate::activity::csv_cell;
use crate::log::PersistedLog;
use crate::storage::KeyValueStore;
use crate::Result;
use chrono::{DateTime, Duration, Local, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

pub const SENSOR_KEY: &str = "sos.sensor_readings";
pub const MAX_READINGS: usize = 10_000;
/// Newest readings written on each save; older ones stay in memory only.
pub const PERSIST_WINDOW: usize = 1_000;
/// Streamed lines buffered before the store is written.
pub const SAVE_EVERY_LINES: usize = 25;

const TREND_THRESHOLD: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: f64,
    #[serde(default)]
    pub unit: String,
    pub timestamp: DateTime<Utc>,
}

/// A `name:value` or `name=value` pair found in a line of device output.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReading {
    pub name: String,
    pub value: f64,
    pub unit: String,
}

/// Extract numeric readings from a line such as `temp:23.5C, hum=40%`.
///
/// Names are lowercased. A trailing non-numeric suffix on the value is kept
/// as the unit. Tokens that don't parse are skipped.
pub fn parse_readings(line: &str) -> Vec<ParsedReading> {
    let normalized = line
        .replace(" :", ":")
        .replace(": ", ":")
        .replace(" =", "=")
        .replace("= ", "=");

    normalized
        .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter_map(parse_pair)
        .collect()
}

fn parse_pair(token: &str) -> Option<ParsedReading> {
    let (name, rest) = token.split_once(|c| c == ':' || c == '=')?;
    let name = name.trim().to_lowercase();
    if name.is_empty() || !name.chars().next()?.is_alphabetic() {
        return None;
    }
    if !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
        return None;
    }

    let rest = rest.trim();
    let split = rest
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || (*i == 0 && (*c == '-' || *c == '+'))))
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    let value: f64 = rest[..split].parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(ParsedReading {
        name,
        value,
        unit: rest[split..].to_string(),
    })
}

/// Readings keyed by name, last one wins. Input for automation rules.
pub fn readings_map(parsed: &[ParsedReading]) -> HashMap<String, f64> {
    parsed.iter().map(|r| (r.name.clone(), r.value)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub count: usize,
    pub latest: Option<f64>,
    pub trend: Trend,
}

impl SensorStats {
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self {
                min: 0.0,
                max: 0.0,
                avg: 0.0,
                count: 0,
                latest: None,
                trend: Trend::Stable,
            };
        }
        let sum: f64 = values.iter().sum();
        Self {
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            avg: sum / values.len() as f64,
            count: values.len(),
            latest: values.last().copied(),
            trend: trend(values),
        }
    }
}

/// Least-squares slope over sample index.
pub fn trend(values: &[f64]) -> Trend {
    let n = values.len();
    if n < 2 {
        return Trend::Stable;
    }
    let n_f = n as f64;
    let (mut sx, mut sy, mut sxy, mut sxx) = (0.0, 0.0, 0.0, 0.0);
    for (i, y) in values.iter().enumerate() {
        let x = i as f64;
        sx += x;
        sy += y;
        sxy += x * y;
        sxx += x * x;
    }
    let slope = (n_f * sxy - sx * sy) / (n_f * sxx - sx * sx);
    if slope > TREND_THRESHOLD {
        Trend::Increasing
    } else if slope < -TREND_THRESHOLD {
        Trend::Decreasing
    } else {
        Trend::Stable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRange {
    Day,
    Week,
    Month,
}

impl TimeRange {
    pub fn duration(&self) -> Duration {
        match self {
            TimeRange::Day => Duration::days(1),
            TimeRange::Week => Duration::days(7),
            TimeRange::Month => Duration::days(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSummary {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub by_kind: BTreeMap<String, SensorStats>,
    pub total_readings: usize,
}

pub struct SensorStore {
    readings: PersistedLog<SensorReading>,
    save_every: usize,
    unsaved_lines: usize,
}

impl SensorStore {
    pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            readings: PersistedLog::load(store, SENSOR_KEY, MAX_READINGS)
                .with_persist_window(PERSIST_WINDOW),
            save_every: SAVE_EVERY_LINES,
            unsaved_lines: 0,
        }
    }

    /// Write after every `lines` streamed lines instead of the default.
    pub fn with_save_every(mut self, lines: usize) -> Self {
        self.save_every = lines.max(1);
        self
    }

    /// Write any buffered lines now.
    pub fn flush(&mut self) {
        if self.unsaved_lines > 0 {
            self.readings.save();
            self.unsaved_lines = 0;
        }
    }

    pub fn len(&self) -> usize {
        self.readings.log().len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.log().is_empty()
    }

    pub fn record(&mut self, kind: &str, value: f64, unit: &str) -> SensorReading {
        let reading = self.push(kind, value, unit, Utc::now());
        self.readings.save();
        self.unsaved_lines = 0;
        reading
    }

    /// Record every parsed reading from one streamed line. The store is
    /// written once per `save_every` lines; call [`flush`](Self::flush)
    /// when the stream ends.
    pub fn record_all(&mut self, parsed: &[ParsedReading], at: DateTime<Utc>) -> usize {
        if parsed.is_empty() {
            return 0;
        }
        for r in parsed {
            self.push(&r.name, r.value, &r.unit, at);
        }
        self.unsaved_lines += 1;
        if self.unsaved_lines >= self.save_every {
            self.flush();
        }
        debug!(target: "analytics", count = parsed.len(), "Stored sensor readings");
        parsed.len()
    }

    fn push(&mut self, kind: &str, value: f64, unit: &str, at: DateTime<Utc>) -> SensorReading {
        let reading = SensorReading {
            kind: kind.to_lowercase(),
            value,
            unit: unit.to_string(),
            timestamp: at,
        };
        self.readings.log_mut().push(reading.clone());
        reading
    }

    /// Readings in `[start, end]`, oldest first. `kind = None` matches all.
    pub fn range(
        &self,
        kind: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<SensorReading> {
        self.readings
            .log()
            .iter()
            .filter(|r| kind.map_or(true, |k| r.kind == k))
            .filter(|r| r.timestamp >= start && r.timestamp <= end)
            .cloned()
            .collect()
    }

    /// Distinct reading kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.readings.log().iter().map(|r| r.kind.clone()).collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }

    pub fn stats(&self, kind: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> SensorStats {
        let values: Vec<f64> = self
            .range(Some(kind), start, end)
            .iter()
            .map(|r| r.value)
            .collect();
        SensorStats::from_values(&values)
    }

    pub fn summary(&self, range: TimeRange, now: DateTime<Utc>) -> SensorSummary {
        let start = now - range.duration();
        let mut by_kind = BTreeMap::new();
        let mut total_readings = 0;
        for kind in self.kinds() {
            let stats = self.stats(&kind, start, now);
            total_readings += stats.count;
            if stats.count > 0 {
                by_kind.insert(kind, stats);
            }
        }
        SensorSummary {
            start,
            end: now,
            by_kind,
            total_readings,
        }
    }

    /// Average per local hour of day over the last `hours` hours.
    pub fn hourly_averages(&self, kind: &str, hours: i64, now: DateTime<Utc>) -> BTreeMap<u32, f64> {
        let mut buckets: BTreeMap<u32, (f64, usize)> = BTreeMap::new();
        for r in self.range(Some(kind), now - Duration::hours(hours), now) {
            let hour = r.timestamp.with_timezone(&Local).hour();
            let slot = buckets.entry(hour).or_insert((0.0, 0));
            slot.0 += r.value;
            slot.1 += 1;
        }
        buckets
            .into_iter()
            .map(|(h, (sum, n))| (h, sum / n as f64))
            .collect()
    }

    pub fn clear(&mut self) {
        self.readings.clear();
        self.unsaved_lines = 0;
    }

    /// `None` when there is nothing to export.
    pub fn export_csv(&self, readings: &[SensorReading]) -> Option<String> {
        if readings.is_empty() {
            warn!(target: "analytics", "No data to export");
            return None;
        }
        let mut out = String::from("type,value,unit,timestamp");
        for r in readings {
            out.push('\n');
            out.push_str(&format!(
                "{},{},{},{}",
                csv_cell(&r.kind),
                r.value,
                csv_cell(&r.unit),
                r.timestamp.to_rfc3339()
            ));
        }
        Some(out)
    }

    pub fn export_json(&self, readings: &[SensorReading]) -> Result<Option<String>> {
        if readings.is_empty() {
            warn!(target: "analytics", "No data to export");
            return Ok(None);
        }
        Ok(Some(serde_json::to_string_pretty(readings)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_splits_unit() {
        let r = parse_pair("temp:23.5C").unwrap();
        assert_eq!(r.name, "temp");
        assert_eq!(r.value, 23.5);
        assert_eq!(r.unit, "C");
    }

    #[test]
    fn pair_rejects_non_numeric() {
        assert!(parse_pair("emg|fire").is_none());
        assert!(parse_pair("status:ok").is_none());
        assert!(parse_pair("12:30").is_none());
    }
}
