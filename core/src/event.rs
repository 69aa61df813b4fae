// Event bus implementation
use crate::activity::ActivityEntry;
use crate::alert::AlertEvent;
use crate::device::{AutomationRule, ScheduledTask};
use crate::emergency::EmergencyRecord;
use crate::location::{Geofence, LocationFix};
use crate::notify::Notification;
use crate::util::{gen_id, now_ms};
use crate::Result;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Delivery class of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QoSLevel {
    /// Never blocks the publisher; drops when the queue is full.
    Realtime,
    Batched,
    Background,
}

/// Event topics. One per service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    Serial,
    Alert,
    Activity,
    Device,
    Location,
    Emergency,
    Notification,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Serial => "serial",
            Topic::Alert => "alert",
            Topic::Activity => "activity",
            Topic::Device => "device",
            Topic::Location => "location",
            Topic::Emergency => "emergency",
            Topic::Notification => "notification",
        }
    }
}

/// Typed event payloads, one variant per event kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum EventPayload {
    SerialConnected { source: String },
    SerialDisconnected { source: String, reason: String },
    ChunkReceived { text: String },
    AlertRaised(AlertEvent),
    AlertAcknowledged(AlertEvent),
    ActivityLogged(ActivityEntry),
    CommandSent { command: String },
    TaskExecuted(ScheduledTask),
    AutomationTriggered {
        rule: AutomationRule,
        readings: HashMap<String, f64>,
    },
    GeofenceEntered { geofence: Geofence, fix: LocationFix },
    GeofenceExited { geofence: Geofence, fix: LocationFix },
    PanicCountdown { seconds: u32 },
    PanicCancelled,
    EmergencyTriggered(EmergencyRecord),
    EmergencyAcknowledged(EmergencyRecord),
    NotificationShown(Notification),
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::SerialConnected { .. } => "serial.connected",
            EventPayload::SerialDisconnected { .. } => "serial.disconnected",
            EventPayload::ChunkReceived { .. } => "chunk.received",
            EventPayload::AlertRaised(_) => "alert.raised",
            EventPayload::AlertAcknowledged(_) => "alert.acknowledged",
            EventPayload::ActivityLogged(_) => "activity.logged",
            EventPayload::CommandSent { .. } => "command.sent",
            EventPayload::TaskExecuted(_) => "task.executed",
            EventPayload::AutomationTriggered { .. } => "automation.triggered",
            EventPayload::GeofenceEntered { .. } => "geofence.entered",
            EventPayload::GeofenceExited { .. } => "geofence.exited",
            EventPayload::PanicCountdown { .. } => "panic.countdown",
            EventPayload::PanicCancelled => "panic.cancelled",
            EventPayload::EmergencyTriggered(_) => "emergency.triggered",
            EventPayload::EmergencyAcknowledged(_) => "emergency.acknowledged",
            EventPayload::NotificationShown(_) => "notification.shown",
        }
    }

    /// Topic this payload is published on.
    pub fn topic(&self) -> Topic {
        match self {
            EventPayload::SerialConnected { .. }
            | EventPayload::SerialDisconnected { .. }
            | EventPayload::ChunkReceived { .. } => Topic::Serial,
            EventPayload::AlertRaised(_) | EventPayload::AlertAcknowledged(_) => Topic::Alert,
            EventPayload::ActivityLogged(_) => Topic::Activity,
            EventPayload::CommandSent { .. }
            | EventPayload::TaskExecuted(_)
            | EventPayload::AutomationTriggered { .. } => Topic::Device,
            EventPayload::GeofenceEntered { .. } | EventPayload::GeofenceExited { .. } => {
                Topic::Location
            }
            EventPayload::PanicCountdown { .. }
            | EventPayload::PanicCancelled
            | EventPayload::EmergencyTriggered(_)
            | EventPayload::EmergencyAcknowledged(_) => Topic::Emergency,
            EventPayload::NotificationShown(_) => Topic::Notification,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub timestamp_ms: i64,
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: &str, payload: EventPayload) -> Self {
        Self {
            id: gen_id("evt"),
            timestamp_ms: now_ms(),
            source: source.to_string(),
            payload,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

/// Subscription information
#[derive(Debug, Clone)]
struct Subscription {
    id: String,
    event_types: Vec<String>,
    qos: QoSLevel,
    sender: mpsc::Sender<Event>,
}

/// Event bus statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBusStats {
    pub total_published: u64,
    pub total_delivered: u64,
    pub active_subscriptions: usize,
    pub backlog_size: usize,
    pub dropped_events: u64,
}

/// Topic-routed pub/sub. No delivery guarantee beyond the subscriber's
/// queue: realtime subscribers lose events when they fall behind.
pub struct EventBus {
    // Topic -> Subscriber list
    subscriptions: Arc<DashMap<Topic, Vec<Subscription>>>,

    // Statistics
    stats: Arc<DashMap<Topic, EventBusStats>>,

    // Backpressure threshold
    backpressure_threshold: usize,
}

impl EventBus {
    pub async fn new() -> Result<Self> {
        Ok(Self {
            subscriptions: Arc::new(DashMap::new()),
            stats: Arc::new(DashMap::new()),
            backpressure_threshold: 10_000,
        })
    }

    pub async fn start(&self) -> Result<()> {
        info!(target: "event_bus", "Event Bus started");
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!(target: "event_bus", "Event Bus shutting down");
        self.subscriptions.clear();
        Ok(())
    }

    /// Publish an event on its payload's topic. Returns how many subscribers
    /// received it.
    pub async fn publish(&self, event: Event) -> Result<u64> {
        let topic = event.payload.topic();
        debug!(target: "event_bus", id = %event.id, kind = event.kind(), topic = topic.as_str(), "Publishing event");

        let current_backlog = self.update_stats_and_get(topic, |stats| {
            stats.total_published += 1;
            stats.backlog_size = stats.backlog_size.saturating_add(1);
            stats.backlog_size
        });
        let over_threshold = current_backlog >= self.backpressure_threshold;

        // Clone the subscriber list so no map guard is held across an await.
        let subs = match self.subscriptions.get(&topic) {
            Some(subs) => subs.value().clone(),
            None => {
                debug!(target: "event_bus", topic = topic.as_str(), "No subscriptions for topic");
                self.update_stats(topic, |stats| {
                    stats.backlog_size = stats.backlog_size.saturating_sub(1);
                });
                return Ok(0);
            }
        };

        let mut delivered = 0;
        let mut dropped = 0;

        for sub in &subs {
            if !sub.event_types.is_empty() && !sub.event_types.iter().any(|t| t == event.kind()) {
                continue;
            }

            match sub.qos {
                QoSLevel::Realtime => {
                    if over_threshold {
                        dropped += 1;
                        continue;
                    }
                    if sub.sender.try_send(event.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        dropped += 1;
                        warn!(target: "event_bus", subscription = %sub.id, "Dropped realtime event");
                    }
                }
                QoSLevel::Batched | QoSLevel::Background => {
                    match sub.sender.send(event.clone()).await {
                        Ok(_) => delivered += 1,
                        Err(_) => {
                            dropped += 1;
                            warn!(target: "event_bus", subscription = %sub.id, "Failed to send event");
                        }
                    }
                }
            }
        }

        self.update_stats(topic, |stats| {
            stats.total_delivered += delivered;
            stats.dropped_events += dropped;
            stats.backlog_size = stats.backlog_size.saturating_sub(1);
        });

        Ok(delivered)
    }

    /// Publish and log instead of failing. For services whose event fan-out
    /// is a side effect.
    pub async fn emit(&self, source: &str, payload: EventPayload) {
        if let Err(e) = self.publish(Event::new(source, payload)).await {
            warn!(target: "event_bus", error = %e, source, "Failed to publish event");
        }
    }

    /// Subscribe to a topic. An empty `event_types` receives every kind.
    pub async fn subscribe(
        &self,
        topic: Topic,
        event_types: Vec<String>,
        qos: QoSLevel,
    ) -> Result<(String, mpsc::Receiver<Event>)> {
        let subscription_id = gen_id(&format!("sub_{}", topic.as_str()));
        let cap = match qos {
            QoSLevel::Realtime => 64,
            QoSLevel::Batched => 1024,
            QoSLevel::Background => 4096,
        };
        let (tx, rx) = mpsc::channel(cap);

        self.subscriptions.entry(topic).or_default().push(Subscription {
            id: subscription_id.clone(),
            event_types,
            qos,
            sender: tx,
        });

        self.update_stats(topic, |stats| {
            stats.active_subscriptions += 1;
        });

        info!(target: "event_bus", subscription = %subscription_id, topic = topic.as_str(), "Created subscription");
        Ok((subscription_id, rx))
    }

    /// Unsubscribe from topic
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        for mut entry in self.subscriptions.iter_mut() {
            let topic = *entry.key();
            let before = entry.value().len();
            entry.value_mut().retain(|sub| sub.id != subscription_id);
            let removed = before - entry.value().len();

            if removed > 0 {
                self.update_stats(topic, |stats| {
                    stats.active_subscriptions =
                        stats.active_subscriptions.saturating_sub(removed);
                });
            }
        }

        info!(target: "event_bus", subscription = %subscription_id, "Unsubscribed");
        Ok(())
    }

    /// Get stats
    pub fn get_stats(&self, topic: Topic) -> Option<EventBusStats> {
        self.stats.get(&topic).map(|s| s.clone())
    }

    fn update_stats<F>(&self, topic: Topic, f: F)
    where
        F: FnOnce(&mut EventBusStats),
    {
        let mut entry = self.stats.entry(topic).or_default();
        f(entry.value_mut());
    }

    fn update_stats_and_get<F>(&self, topic: Topic, f: F) -> usize
    where
        F: FnOnce(&mut EventBusStats) -> usize,
    {
        let mut entry = self.stats.entry(topic).or_default();
        f(entry.value_mut())
    }
}
