// SOS Connect Core Library
// Serial stream monitor with emergency keyword alerting

pub mod activity;
pub mod alert;
pub mod analytics;
pub mod audio;
pub mod device;
pub mod emergency;
pub mod event;
pub mod keywords;
pub mod location;
pub mod log;
pub mod notify;
pub mod serial;
pub mod storage;
pub mod weather;

mod util;

// Export core types
pub use activity::{ActivityCategory, ActivityEntry, ActivityLevel, ActivityLog, LogQuery};
pub use alert::{AlertCenter, AlertEvent, AlertSink, AlertState};
pub use audio::{AudioSink, Tone, TonePattern};
pub use event::{Event, EventBus, EventPayload, QoSLevel, Topic};
pub use keywords::{ChunkScanner, KeywordEntry, KeywordTable};
pub use log::{BoundedLog, PersistedLog};
pub use serial::{SerialConfig, SerialConnection, SerialMonitor, SerialSource};
pub use storage::{JsonStoreExt, KeyValueStore, MemoryStore, RocksStore};

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum SosError {
    #[error("Event bus error: {0}")]
    EventBusError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Storage quota exceeded writing {key} ({bytes} bytes)")]
    QuotaExceeded { key: String, bytes: usize },

    #[error("Serial error: {0}")]
    SerialError(String),

    #[error("Device error: {0}")]
    DeviceError(String),

    #[error("Alert display error: {0}")]
    DisplayError(String),

    #[error("Audio error: {0}")]
    AudioError(String),

    #[error("Contact delivery error: {0}")]
    DeliveryError(String),

    #[error("Weather error: {0}")]
    WeatherError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
pub type Result<T> = std::result::Result<T, SosError>;

/// The set of independent services behind one monitor session.
///
/// Every service owns its own storage key and talks to the others only
/// through `event_bus`.
pub struct SosConnect {
    pub event_bus: Arc<EventBus>,
    pub store: Arc<dyn KeyValueStore>,
    pub alerts: Arc<Mutex<AlertCenter>>,
    pub activity: Arc<Mutex<ActivityLog>>,
    pub notifications: Arc<Mutex<notify::NotificationCenter>>,
    pub emergency: Arc<Mutex<emergency::EmergencyDesk>>,
    pub panic: emergency::PanicButton,
    pub device: Arc<Mutex<device::DeviceControl>>,
    pub location: Arc<Mutex<location::LocationTracker>>,
    pub sensors: Arc<Mutex<analytics::SensorStore>>,
}

/// Per-service settings for [`SosConnect::new`].
#[derive(Clone, Debug, Default)]
pub struct CoreConfig {
    pub scanner: keywords::ScannerConfig,
    pub activity: activity::ActivityConfig,
    pub panic: emergency::PanicConfig,
}

/// Injected collaborators for [`SosConnect::new`].
pub struct Sinks {
    pub alert: Arc<dyn AlertSink>,
    pub audio: Arc<dyn AudioSink>,
    pub contacts: Arc<dyn emergency::ContactNotifier>,
}

impl SosConnect {
    pub async fn new(
        store: Arc<dyn KeyValueStore>,
        table: KeywordTable,
        cfg: CoreConfig,
        sinks: Sinks,
    ) -> Result<Self> {
        let event_bus = Arc::new(EventBus::new().await?);

        let alerts = AlertCenter::new(
            table,
            cfg.scanner,
            Arc::clone(&store),
            Arc::clone(&sinks.alert),
            Arc::clone(&sinks.audio),
        )
        .with_bus(Arc::clone(&event_bus));
        let activity = ActivityLog::load(
            Arc::clone(&store),
            cfg.activity,
            Some(Arc::clone(&event_bus)),
        );
        let notifications = notify::NotificationCenter::load(
            Arc::clone(&store),
            Arc::clone(&sinks.audio),
            Some(Arc::clone(&event_bus)),
        );
        let mut emergency = emergency::EmergencyDesk::load(
            Arc::clone(&store),
            Arc::clone(&sinks.contacts),
            Arc::clone(&sinks.audio),
            Some(Arc::clone(&event_bus)),
        );
        let device = device::DeviceControl::load(Arc::clone(&store), Some(Arc::clone(&event_bus)));
        let location =
            location::LocationTracker::load(Arc::clone(&store), Some(Arc::clone(&event_bus)));
        let sensors = analytics::SensorStore::load(Arc::clone(&store));
        emergency.set_location(location.last_fix().cloned());

        let emergency = Arc::new(Mutex::new(emergency));
        let panic = emergency::PanicButton::new(
            Arc::clone(&emergency),
            cfg.panic,
            Some(Arc::clone(&event_bus)),
        );

        Ok(Self {
            event_bus,
            store,
            alerts: Arc::new(Mutex::new(alerts)),
            activity: Arc::new(Mutex::new(activity)),
            notifications: Arc::new(Mutex::new(notifications)),
            emergency,
            panic,
            device: Arc::new(Mutex::new(device)),
            location: Arc::new(Mutex::new(location)),
            sensors: Arc::new(Mutex::new(sensors)),
        })
    }

    pub async fn start(&self) -> Result<()> {
        tracing::info!("Starting SOS Connect...");
        self.event_bus.start().await?;
        self.activity
            .lock()
            .await
            .log_system("Monitor started", serde_json::json!({}));
        tracing::info!("SOS Connect started successfully");
        Ok(())
    }

    /// Record a position fix. Later emergency records carry it.
    pub async fn update_location(
        &self,
        fix: location::LocationFix,
    ) -> Vec<location::GeofenceTransition> {
        self.emergency.lock().await.set_location(Some(fix.clone()));
        self.location.lock().await.update(fix).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down SOS Connect...");
        self.activity
            .lock()
            .await
            .log_system("Monitor stopped", serde_json::json!({}));
        self.sensors.lock().await.flush();
        self.event_bus.shutdown().await?;
        tracing::info!("SOS Connect shut down successfully");
        Ok(())
    }
}
