use chrono::{Duration, Utc};
use sos_core::analytics::{
    parse_readings, readings_map, trend, ParsedReading, SensorReading, SensorStats, SensorStore,
    TimeRange, Trend, PERSIST_WINDOW,
};
use sos_core::{KeyValueStore, MemoryStore, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts writes on top of an in-memory store.
#[derive(Default)]
struct CountingStore {
    inner: MemoryStore,
    puts: AtomicUsize,
}

impl KeyValueStore for CountingStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }

    fn keys(&self) -> Result<Vec<String>> {
        self.inner.keys()
    }
}

fn store() -> SensorStore {
    SensorStore::load(Arc::new(MemoryStore::new()))
}

fn reading(name: &str, value: f64) -> ParsedReading {
    ParsedReading {
        name: name.into(),
        value,
        unit: String::new(),
    }
}

#[test]
fn parses_mixed_separators_and_units() {
    let parsed = parse_readings("Temp: 23.5C, hum=40%; pressure = 1013.2hPa");
    assert_eq!(
        parsed,
        vec![
            ParsedReading {
                name: "temp".into(),
                value: 23.5,
                unit: "C".into()
            },
            ParsedReading {
                name: "hum".into(),
                value: 40.0,
                unit: "%".into()
            },
            ParsedReading {
                name: "pressure".into(),
                value: 1013.2,
                unit: "hPa".into()
            },
        ]
    );
}

#[test]
fn skips_non_readings() {
    assert!(parse_readings("emg|fire detected").is_empty());
    assert!(parse_readings("status:ok 9:1").is_empty());
    let parsed = parse_readings("offset:-2.5 gain:+3");
    assert_eq!(parsed.iter().map(|r| r.value).collect::<Vec<_>>(), vec![-2.5, 3.0]);
}

#[test]
fn readings_map_keeps_last_value() {
    let map = readings_map(&[reading("temp", 1.0), reading("temp", 2.0)]);
    assert_eq!(map["temp"], 2.0);
}

#[test]
fn stats_and_trend() {
    let stats = SensorStats::from_values(&[10.0, 12.0, 14.0]);
    assert_eq!(stats.min, 10.0);
    assert_eq!(stats.max, 14.0);
    assert_eq!(stats.avg, 12.0);
    assert_eq!(stats.latest, Some(14.0));
    assert_eq!(stats.trend, Trend::Increasing);

    assert_eq!(trend(&[5.0, 4.0, 3.0]), Trend::Decreasing);
    assert_eq!(trend(&[5.0, 5.05, 5.0]), Trend::Stable);
    assert_eq!(trend(&[1.0]), Trend::Stable);
    assert_eq!(SensorStats::from_values(&[]).count, 0);
}

#[test]
fn range_and_summary() {
    let mut sensors = store();
    let now = Utc::now();
    sensors.record_all(&[reading("temp", 20.0), reading("hum", 50.0)], now - Duration::days(3));
    sensors.record_all(&[reading("temp", 22.0)], now - Duration::hours(2));
    sensors.record_all(&[reading("temp", 24.0)], now - Duration::minutes(5));

    let day = sensors.summary(TimeRange::Day, now);
    assert_eq!(day.total_readings, 2);
    assert_eq!(day.by_kind.keys().collect::<Vec<_>>(), vec!["temp"]);
    assert_eq!(day.by_kind["temp"].avg, 23.0);

    let week = sensors.summary(TimeRange::Week, now);
    assert_eq!(week.total_readings, 4);
    assert_eq!(week.by_kind["hum"].count, 1);

    let temps = sensors.range(Some("temp"), now - Duration::days(7), now);
    assert_eq!(temps.len(), 3);
    assert_eq!(sensors.range(None, now - Duration::days(7), now).len(), 4);
}

#[test]
fn hourly_averages_bucket_by_hour() {
    let mut sensors = store();
    let now = Utc::now();
    sensors.record_all(&[reading("temp", 10.0)], now - Duration::minutes(1));
    sensors.record_all(&[reading("temp", 20.0)], now - Duration::minutes(1));
    let buckets = sensors.hourly_averages("temp", 24, now);
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets.values().next(), Some(&15.0));
}

#[test]
fn readings_persist_and_clear() {
    let backing: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    {
        let mut sensors = SensorStore::load(Arc::clone(&backing));
        sensors.record("gas", 0.4, "ppm");
    }
    let mut sensors = SensorStore::load(backing);
    assert_eq!(sensors.len(), 1);
    assert_eq!(sensors.kinds(), vec!["gas".to_string()]);
    sensors.clear();
    assert!(sensors.is_empty());
}

#[test]
fn csv_and_json_export() {
    let sensors = store();
    assert!(sensors.export_csv(&[]).is_none());
    assert!(sensors.export_json(&[]).unwrap().is_none());

    let rows = vec![SensorReading {
        kind: "temp".into(),
        value: 21.5,
        unit: "C".into(),
        timestamp: Utc::now(),
    }];
    let csv = sensors.export_csv(&rows).unwrap();
    let mut lines = csv.lines();
    assert_eq!(lines.next(), Some("type,value,unit,timestamp"));
    assert!(lines.next().unwrap().starts_with("\"temp\",21.5,\"C\","));

    let json = sensors.export_json(&rows).unwrap().unwrap();
    let back: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(back[0]["type"], "temp");
}

#[test]
fn streamed_lines_are_saved_in_batches() {
    let backing = Arc::new(CountingStore::default());
    let mut sensors =
        SensorStore::load(Arc::clone(&backing) as Arc<dyn KeyValueStore>).with_save_every(10);
    let now = Utc::now();
    for i in 0..25 {
        sensors.record_all(&[reading("temp", i as f64)], now);
    }
    assert_eq!(backing.puts.load(Ordering::SeqCst), 2);

    sensors.flush();
    assert_eq!(backing.puts.load(Ordering::SeqCst), 3);
    sensors.flush();
    assert_eq!(backing.puts.load(Ordering::SeqCst), 3);

    let reloaded = SensorStore::load(backing);
    assert_eq!(reloaded.len(), 25);
}

#[test]
fn only_the_newest_window_is_written() {
    let backing: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let mut sensors = SensorStore::load(Arc::clone(&backing)).with_save_every(500);
    let now = Utc::now();
    for i in 0..1500 {
        sensors.record_all(&[reading("temp", i as f64)], now);
    }
    assert_eq!(sensors.len(), 1500);

    let reloaded = SensorStore::load(backing);
    assert_eq!(reloaded.len(), PERSIST_WINDOW);
    let values: Vec<f64> = reloaded
        .range(Some("temp"), now, now)
        .iter()
        .map(|r| r.value)
        .collect();
    assert_eq!(values.first(), Some(&500.0));
    assert_eq!(values.last(), Some(&1499.0));
}

#[test]
fn csv_export_escapes_quotes_in_units() {
    let sensors = store();
    let parsed = parse_readings("temp:5\"x");
    assert_eq!(parsed[0].unit, "\"x");

    let rows = vec![SensorReading {
        kind: "temp".into(),
        value: 5.0,
        unit: parsed[0].unit.clone(),
        timestamp: Utc::now(),
    }];
    let csv = sensors.export_csv(&rows).unwrap();
    let row = csv.lines().nth(1).unwrap();
    assert!(row.starts_with("\"temp\",5,\"\"\"x\","), "{}", row);
}
