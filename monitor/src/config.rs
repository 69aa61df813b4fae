use std::fs;
use std::path::{Path, PathBuf};

use sos_core::activity::ActivityConfig;
use sos_core::device::SchedulerConfig;
use sos_core::emergency::PanicConfig;
use sos_core::keywords::ScannerConfig;
use sos_core::serial::{Parity, SerialConfig};
use sos_core::weather::WeatherConfig;
use sos_core::{KeywordEntry, KeywordTable};

/// High-level configuration for the monitor
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// RocksDB directory
    pub data_dir: PathBuf,
    pub serial: SerialConfig,
    pub scanner: ScannerConfig,
    pub scheduler: SchedulerConfig,
    pub activity: ActivityConfig,
    pub panic: PanicConfig,
    pub weather: WeatherConfig,
    /// Place shown by `run` in the weather line; none disables it
    pub weather_location: Option<String>,
    pub keywords: KeywordTable,
    pub sound: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            data_dir: std::env::var("SOS_DATA_DIR")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sos_data")),
            serial: SerialConfig::default(),
            scanner: ScannerConfig::default(),
            scheduler: SchedulerConfig::default(),
            activity: ActivityConfig::default(),
            panic: PanicConfig::default(),
            weather: WeatherConfig::default(),
            weather_location: std::env::var("SOS_WEATHER_LOCATION")
                .ok()
                .filter(|s| !s.is_empty()),
            keywords: KeywordTable::default(),
            sound: std::env::var("SOS_SOUND")
                .map(|s| !matches!(s.as_str(), "0" | "false" | "off" | "no"))
                .unwrap_or(true),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from a TOML file (`path`, else SOS_MONITOR_CONFIG, else
    /// ./sos_monitor.toml), overlaying values onto env-driven defaults.
    pub fn load(path: Option<&Path>) -> Self {
        let default = Self::default();
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => PathBuf::from(
                std::env::var("SOS_MONITOR_CONFIG").unwrap_or_else(|_| "sos_monitor.toml".into()),
            ),
        };
        if !path.exists() {
            tracing::info!(target: "sos_monitor", path = %path.display(), "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(&path) {
            Ok(s) => Self::from_toml_str(&s).unwrap_or_else(|e| {
                tracing::warn!(target: "sos_monitor", error = %e, "Failed to parse TOML; using defaults");
                default
            }),
            Err(e) => {
                tracing::warn!(target: "sos_monitor", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, String> {
        let t = toml::from_str::<MonitorToml>(s).map_err(|e| e.to_string())?;
        t.overlay(Self::default())
    }
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct MonitorToml {
    pub data_dir: Option<PathBuf>,
    pub sound: Option<bool>,
    pub serial: Option<SerialToml>,
    pub scanner: Option<ScannerToml>,
    pub scheduler: Option<SchedulerToml>,
    pub activity: Option<ActivityToml>,
    pub panic: Option<PanicToml>,
    pub weather: Option<WeatherToml>,
    /// Replaces the built-in table when present
    pub keywords: Option<Vec<KeywordEntry>>,
}

impl MonitorToml {
    fn overlay(self, mut base: MonitorConfig) -> Result<MonitorConfig, String> {
        if let Some(d) = self.data_dir {
            base.data_dir = d;
        }
        if let Some(s) = self.sound {
            base.sound = s;
        }
        if let Some(s) = self.serial {
            s.apply(&mut base.serial);
        }
        if let Some(s) = self.scanner {
            s.apply(&mut base.scanner);
        }
        if let Some(s) = self.scheduler {
            s.apply(&mut base.scheduler);
        }
        if let Some(a) = self.activity {
            a.apply(&mut base.activity);
        }
        if let Some(p) = self.panic {
            p.apply(&mut base.panic);
        }
        if let Some(w) = self.weather {
            if let Some(loc) = w.location.clone() {
                base.weather_location = Some(loc).filter(|s| !s.is_empty());
            }
            w.apply(&mut base.weather);
        }
        if let Some(entries) = self.keywords {
            base.keywords = KeywordTable::from_entries(entries).map_err(|e| e.to_string())?;
        }
        Ok(base)
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct SerialToml {
    pub baud_rate: Option<u32>,
    pub data_bits: Option<u8>,
    pub stop_bits: Option<u8>,
    pub parity: Option<Parity>,
    pub max_log_size: Option<usize>,
    pub read_buffer_size: Option<usize>,
}
impl SerialToml {
    fn apply(self, s: &mut SerialConfig) {
        if let Some(v) = self.baud_rate {
            s.baud_rate = v;
        }
        if let Some(v) = self.data_bits {
            s.data_bits = v.clamp(5, 8);
        }
        if let Some(v) = self.stop_bits {
            s.stop_bits = v.clamp(1, 2);
        }
        if let Some(v) = self.parity {
            s.parity = v;
        }
        if let Some(v) = self.max_log_size {
            s.max_log_size = v;
        }
        if let Some(v) = self.read_buffer_size {
            s.read_buffer_size = v;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct ScannerToml {
    pub span_chunks: Option<bool>,
}
impl ScannerToml {
    fn apply(self, s: &mut ScannerConfig) {
        if let Some(v) = self.span_chunks {
            s.span_chunks = v;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct SchedulerToml {
    pub tick_ms: Option<u64>,
}
impl SchedulerToml {
    fn apply(self, s: &mut SchedulerConfig) {
        if let Some(v) = self.tick_ms.filter(|v| *v > 0) {
            s.tick_ms = v;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct ActivityToml {
    pub max_logs: Option<usize>,
    pub persist_window: Option<usize>,
    pub retention_days: Option<i64>,
}
impl ActivityToml {
    fn apply(self, a: &mut ActivityConfig) {
        if let Some(v) = self.max_logs {
            a.max_logs = v;
        }
        if let Some(v) = self.persist_window {
            a.persist_window = v;
        }
        if let Some(v) = self.retention_days {
            a.retention_days = v.max(1);
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct PanicToml {
    pub countdown_secs: Option<u32>,
}
impl PanicToml {
    fn apply(self, p: &mut PanicConfig) {
        if let Some(v) = self.countdown_secs {
            p.countdown_secs = v;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct WeatherToml {
    pub api_endpoint: Option<String>,
    pub geocoding_endpoint: Option<String>,
    pub timeout_ms: Option<u64>,
    pub refresh_secs: Option<u64>,
    pub location: Option<String>,
}
impl WeatherToml {
    fn apply(self, w: &mut WeatherConfig) {
        if let Some(v) = self.api_endpoint {
            w.api_endpoint = v;
        }
        if let Some(v) = self.geocoding_endpoint {
            w.geocoding_endpoint = v;
        }
        if let Some(v) = self.timeout_ms {
            w.timeout_ms = v;
        }
        if let Some(v) = self.refresh_secs {
            w.refresh_secs = v.max(60);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_replaces_keyword_table() {
        let cfg = MonitorConfig::from_toml_str(
            r##"
            data_dir = "/tmp/sos"

            [serial]
            baud_rate = 9600

            [[keywords]]
            keyword = "MAYDAY"
            title = "MAYDAY"
            icon = "📻"
            message = "Mayday call received!"
            color = "#ff0000"
            "##,
        )
        .unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/sos"));
        assert_eq!(cfg.serial.baud_rate, 9600);
        assert_eq!(cfg.keywords.len(), 1);
        assert_eq!(cfg.keywords.entries()[0].keyword, "mayday");
    }

    #[test]
    fn empty_keyword_is_an_error() {
        let err = MonitorConfig::from_toml_str(
            r##"
            [[keywords]]
            keyword = " "
            title = "x"
            icon = "x"
            message = "x"
            color = "#000000"
            "##,
        );
        assert!(err.is_err());
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.toml");
        fs::write(&path, "sound = false\n[serial]\nbaud_rate = 57600\n").unwrap();

        let cfg = MonitorConfig::load(Some(&path));
        assert!(!cfg.sound);
        assert_eq!(cfg.serial.baud_rate, 57600);
    }

    #[test]
    fn load_falls_back_on_missing_or_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = MonitorConfig::load(Some(&dir.path().join("absent.toml")));
        assert_eq!(missing.keywords.len(), KeywordTable::default().len());

        let broken = dir.path().join("broken.toml");
        fs::write(&broken, "[serial\nbaud_rate = ").unwrap();
        let cfg = MonitorConfig::load(Some(&broken));
        assert_eq!(cfg.keywords.len(), KeywordTable::default().len());
    }

    #[test]
    fn load_uses_env_path_when_none_given() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("from_env.toml");
        fs::write(&path, "data_dir = \"/var/lib/sos\"\n").unwrap();

        std::env::set_var("SOS_MONITOR_CONFIG", &path);
        let cfg = MonitorConfig::load(None);
        std::env::remove_var("SOS_MONITOR_CONFIG");
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/sos"));
    }
}
