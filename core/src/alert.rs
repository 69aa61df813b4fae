//! Emergency alert pipeline: scan -> alert -> acknowledge.
//!
//! Two states. `Idle -> Alerting` when a chunk matches a keyword,
//! `Alerting -> Idle` only when the user acknowledges. A new match while
//! alerting is not suppressed: it records a new alert and restarts the
//! presentation. There is no timeout.
//!
//! Of the side effects of raising an alert only the display is mandatory.
//! Sound and persistence failures are logged and swallowed.

use crate::audio::{AudioSink, TonePattern};
use crate::event::{EventBus, EventPayload};
use crate::keywords::{ChunkScanner, KeywordEntry, KeywordTable, ScannerConfig};
use crate::log::PersistedLog;
use crate::storage::KeyValueStore;
use crate::util::gen_id;
use crate::{Result, SosError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Arc;
use tracing::{error, info, warn};

pub const ALERT_LOG_KEY: &str = "sos.alerts";
pub const ALERT_LOG_CAP: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: String,
    pub keyword: String,
    pub title: String,
    pub icon: String,
    pub message: String,
    pub color: String,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
    #[serde(default)]
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl AlertEvent {
    pub fn from_entry(entry: &KeywordEntry) -> Self {
        Self {
            id: gen_id("alert"),
            keyword: entry.keyword.clone(),
            title: entry.title.clone(),
            icon: entry.icon.clone(),
            message: entry.message.clone(),
            color: entry.color.clone(),
            timestamp: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
        }
    }

    /// Returns false if the alert was already acknowledged.
    fn acknowledge(&mut self) -> bool {
        if self.acknowledged {
            return false;
        }
        self.acknowledged = true;
        self.acknowledged_at = Some(Utc::now());
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertState {
    Idle,
    Alerting { alert_id: String },
}

/// Presents alerts to the user.
pub trait AlertSink: Send + Sync {
    fn present(&self, alert: &AlertEvent) -> Result<()>;
    fn dismiss(&self);
}

/// Prints a colored banner to stderr.
#[derive(Debug, Default)]
pub struct ConsoleAlertSink;

impl ConsoleAlertSink {
    /// `#rrggbb` -> ANSI 24-bit foreground escape.
    fn ansi_color(hex: &str) -> Option<String> {
        let hex = hex.strip_prefix('#')?;
        if hex.len() != 6 {
            return None;
        }
        let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
        let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
        let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
        Some(format!("\x1b[1;38;2;{};{};{}m", r, g, b))
    }
}

impl AlertSink for ConsoleAlertSink {
    fn present(&self, alert: &AlertEvent) -> Result<()> {
        let color = Self::ansi_color(&alert.color).unwrap_or_else(|| "\x1b[1;31m".into());
        let mut err = std::io::stderr().lock();
        writeln!(
            err,
            "\n{}{} {} {}\x1b[0m\n  {}\n  [{}] type :ack to acknowledge",
            color,
            alert.icon,
            alert.title,
            alert.icon,
            alert.message,
            alert.timestamp.format("%Y-%m-%d %H:%M:%S"),
        )
        .map_err(|e| SosError::DisplayError(e.to_string()))?;
        Ok(())
    }

    fn dismiss(&self) {
        let _ = writeln!(std::io::stderr(), "Alert acknowledged.");
    }
}

pub struct AlertCenter {
    scanner: ChunkScanner,
    state: AlertState,
    log: PersistedLog<AlertEvent>,
    display: Arc<dyn AlertSink>,
    audio: Arc<dyn AudioSink>,
    bus: Option<Arc<EventBus>>,
}

impl AlertCenter {
    pub fn new(
        table: KeywordTable,
        scanner: ScannerConfig,
        store: Arc<dyn KeyValueStore>,
        display: Arc<dyn AlertSink>,
        audio: Arc<dyn AudioSink>,
    ) -> Self {
        Self::with_cap(table, scanner, store, display, audio, ALERT_LOG_CAP)
    }

    pub fn with_cap(
        table: KeywordTable,
        scanner: ScannerConfig,
        store: Arc<dyn KeyValueStore>,
        display: Arc<dyn AlertSink>,
        audio: Arc<dyn AudioSink>,
        cap: usize,
    ) -> Self {
        Self {
            scanner: ChunkScanner::new(table, scanner),
            state: AlertState::Idle,
            log: PersistedLog::load(store, ALERT_LOG_KEY, cap),
            display,
            audio,
            bus: None,
        }
    }

    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn state(&self) -> &AlertState {
        &self.state
    }

    pub fn is_alerting(&self) -> bool {
        matches!(self.state, AlertState::Alerting { .. })
    }

    pub fn table(&self) -> &KeywordTable {
        self.scanner.table()
    }

    /// Logged alerts, oldest first.
    pub fn alerts(&self) -> Vec<AlertEvent> {
        self.log.log().iter().cloned().collect()
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<AlertEvent> {
        self.log.log().recent(limit).into_iter().cloned().collect()
    }

    pub fn current(&self) -> Option<&AlertEvent> {
        match &self.state {
            AlertState::Alerting { alert_id } => self.log.log().iter().find(|a| &a.id == alert_id),
            AlertState::Idle => None,
        }
    }

    /// Scan one decoded chunk and raise at most one alert.
    pub async fn process_chunk(&mut self, text: &str) -> Result<Option<AlertEvent>> {
        match self.scanner.scan_chunk(text) {
            Some(entry) => self.raise(&entry).await.map(Some),
            None => Ok(None),
        }
    }

    /// Forget any keyword prefix carried over from the previous chunk.
    pub fn reset_stream(&mut self) {
        self.scanner.reset();
    }

    pub async fn raise(&mut self, entry: &KeywordEntry) -> Result<AlertEvent> {
        let alert = AlertEvent::from_entry(entry);
        if self.is_alerting() {
            info!(target: "alert", title = %alert.title, "Re-triggering while alerting");
        } else {
            info!(target: "alert", title = %alert.title, keyword = %alert.keyword, "Emergency keyword detected");
        }

        self.log.log_mut().push(alert.clone());
        self.state = AlertState::Alerting {
            alert_id: alert.id.clone(),
        };

        if let Err(e) = self.audio.play(&TonePattern::emergency_alarm()) {
            warn!(target: "alert", error = %e, "Emergency sound failed");
        }
        self.log.save();

        if let Some(bus) = &self.bus {
            bus.emit("alert", EventPayload::AlertRaised(alert.clone()))
                .await;
        }

        self.display.present(&alert).map_err(|e| {
            error!(target: "alert", error = %e, "Failed to present alert");
            e
        })?;

        Ok(alert)
    }

    /// Acknowledge the alert currently on screen and return to idle.
    ///
    /// Returns the acknowledged alert, or `None` if there was nothing new to
    /// acknowledge.
    pub async fn acknowledge(&mut self) -> Option<AlertEvent> {
        let alert_id = match std::mem::replace(&mut self.state, AlertState::Idle) {
            AlertState::Alerting { alert_id } => alert_id,
            AlertState::Idle => return None,
        };
        self.display.dismiss();
        self.acknowledge_id(&alert_id).await
    }

    /// Acknowledge a logged alert by id. Acknowledging twice changes nothing.
    pub async fn acknowledge_id(&mut self, id: &str) -> Option<AlertEvent> {
        let acked = self
            .log
            .log_mut()
            .iter_mut()
            .find(|a| a.id == id)
            .and_then(|a| if a.acknowledge() { Some(a.clone()) } else { None })?;

        if matches!(&self.state, AlertState::Alerting { alert_id } if alert_id == id) {
            self.state = AlertState::Idle;
            self.display.dismiss();
        }

        self.log.save();
        info!(target: "alert", id, "Alert acknowledged");
        if let Some(bus) = &self.bus {
            bus.emit("alert", EventPayload::AlertAcknowledged(acked.clone()))
                .await;
        }
        Some(acked)
    }

    /// Bulk-clear the log. Leaves the state machine alone.
    pub fn clear_log(&mut self) {
        self.log.clear();
        info!(target: "alert", "Alert log cleared");
    }

    pub fn export_json(&self) -> Result<String> {
        self.log.export_json()
    }

    pub fn import_json(&mut self, json: &str) -> Result<usize> {
        self.log.import_json(json)
    }
}
