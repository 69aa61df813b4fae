//! Notification center: history, read state and per-kind sounds.

use crate::audio::{AudioSink, TonePattern};
use crate::event::{EventBus, EventPayload};
use crate::log::PersistedLog;
use crate::storage::KeyValueStore;
use crate::util::gen_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

pub const NOTIFICATION_KEY: &str = "sos.notifications";
pub const MAX_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
    Emergency,
}

impl NotificationKind {
    pub fn tone(&self) -> TonePattern {
        match self {
            NotificationKind::Info => TonePattern::notification_default(),
            NotificationKind::Success => TonePattern::notification_success(),
            NotificationKind::Warning => TonePattern::notification_warning(),
            NotificationKind::Emergency => TonePattern::notification_emergency(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub body: String,
    pub icon: String,
    pub kind: NotificationKind,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    #[serde(default)]
    pub data: Value,
}

pub struct NotificationCenter {
    history: PersistedLog<Notification>,
    audio: Arc<dyn AudioSink>,
    sound_enabled: bool,
    bus: Option<Arc<EventBus>>,
}

impl NotificationCenter {
    pub fn load(
        store: Arc<dyn KeyValueStore>,
        audio: Arc<dyn AudioSink>,
        bus: Option<Arc<EventBus>>,
    ) -> Self {
        Self {
            history: PersistedLog::load(store, NOTIFICATION_KEY, MAX_HISTORY),
            audio,
            sound_enabled: true,
            bus,
        }
    }

    pub fn set_sound_enabled(&mut self, enabled: bool) {
        self.sound_enabled = enabled;
    }

    pub fn sound_enabled(&self) -> bool {
        self.sound_enabled
    }

    pub async fn show(
        &mut self,
        kind: NotificationKind,
        title: &str,
        body: &str,
        icon: &str,
        data: Value,
    ) -> Notification {
        let notification = Notification {
            id: gen_id("notification"),
            title: title.to_string(),
            body: body.to_string(),
            icon: icon.to_string(),
            kind,
            timestamp: Utc::now(),
            read: false,
            data,
        };
        self.history.push(notification.clone());
        debug!(target: "notify", title, ?kind, "Notification shown");

        if self.sound_enabled {
            if let Err(e) = self.audio.play(&kind.tone()) {
                warn!(target: "notify", error = %e, "Sound error");
            }
        }

        if let Some(bus) = &self.bus {
            bus.emit("notify", EventPayload::NotificationShown(notification.clone()))
                .await;
        }
        notification
    }

    pub async fn show_emergency(&mut self, title: &str, message: &str, data: Value) -> Notification {
        self.show(NotificationKind::Emergency, title, message, "🚨", data)
            .await
    }

    pub async fn show_sensor_warning(
        &mut self,
        sensor: &str,
        value: f64,
        threshold: f64,
    ) -> Notification {
        let body = format!("{} reading {} exceeded threshold {}", sensor, value, threshold);
        let data = serde_json::json!({ "sensor": sensor, "value": value, "threshold": threshold });
        self.show(NotificationKind::Warning, "Sensor Warning", &body, "⚠️", data)
            .await
    }

    pub async fn show_connection_status(&mut self, connected: bool, details: &str) -> Notification {
        if connected {
            self.show(NotificationKind::Success, "Device Connected", details, "🔌", Value::Null)
                .await
        } else {
            self.show(NotificationKind::Info, "Device Disconnected", details, "📡", Value::Null)
                .await
        }
    }

    /// Newest first.
    pub fn history(&self, limit: usize) -> Vec<Notification> {
        self.history.log().recent(limit).into_iter().cloned().collect()
    }

    pub fn mark_read(&mut self, id: &str) -> bool {
        let found = self
            .history
            .log_mut()
            .iter_mut()
            .find(|n| n.id == id)
            .map(|n| n.read = true)
            .is_some();
        if found {
            self.history.save();
        }
        found
    }

    pub fn mark_all_read(&mut self) {
        self.history.log_mut().iter_mut().for_each(|n| n.read = true);
        self.history.save();
    }

    pub fn unread_count(&self) -> usize {
        self.history.log().iter().filter(|n| !n.read).count()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}
