use super::{EmergencyDesk, EmergencyRecord};
use crate::audio::TonePattern;
use crate::event::{EventBus, EventPayload};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::info;

const PANIC_KIND: &str = "PANIC";
const PANIC_MESSAGE: &str = "Manual panic button activated";

#[derive(Clone, Debug)]
pub struct PanicConfig {
    pub countdown_secs: u32,
    pub tick: Duration,
}

impl Default for PanicConfig {
    fn default() -> Self {
        Self {
            countdown_secs: 10,
            tick: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PanicOutcome {
    Triggered(EmergencyRecord),
    CountdownStarted { seconds: u32 },
    AlreadyActive,
}

/// Panic button with a cancellable countdown.
///
/// Only one countdown runs at a time; activating while one is running does
/// nothing.
pub struct PanicButton {
    desk: Arc<Mutex<EmergencyDesk>>,
    cfg: PanicConfig,
    bus: Option<Arc<EventBus>>,
    cancel: Arc<Mutex<Option<watch::Sender<bool>>>>,
}

impl PanicButton {
    pub fn new(desk: Arc<Mutex<EmergencyDesk>>, cfg: PanicConfig, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            desk,
            cfg,
            bus,
            cancel: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn is_active(&self) -> bool {
        self.cancel.lock().await.is_some()
    }

    pub async fn activate(&self, immediate: bool) -> PanicOutcome {
        let mut slot = self.cancel.lock().await;
        if slot.is_some() {
            return PanicOutcome::AlreadyActive;
        }

        if immediate {
            drop(slot);
            let record = self
                .desk
                .lock()
                .await
                .trigger(PANIC_KIND, PANIC_MESSAGE, Value::Null)
                .await;
            return PanicOutcome::Triggered(record);
        }

        let seconds = self.cfg.countdown_secs;
        let (tx, mut rx) = watch::channel(false);
        *slot = Some(tx);
        drop(slot);

        info!(target: "emergency", seconds, "Panic countdown started");
        self.desk.lock().await.play(&TonePattern::panic_warning());
        if let Some(bus) = &self.bus {
            bus.emit("emergency", EventPayload::PanicCountdown { seconds })
                .await;
        }

        let desk = Arc::clone(&self.desk);
        let bus = self.bus.clone();
        let cancel = Arc::clone(&self.cancel);
        let tick = self.cfg.tick;
        tokio::spawn(async move {
            let mut remaining = seconds;
            while remaining > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(tick) => {}
                    _ = rx.changed() => return,
                }
                remaining -= 1;
                if let Some(bus) = &bus {
                    bus.emit("emergency", EventPayload::PanicCountdown { seconds: remaining })
                        .await;
                }
            }

            // A cancel that lands after the last tick still wins.
            if cancel.lock().await.take().is_none() {
                return;
            }
            desk.lock()
                .await
                .trigger(PANIC_KIND, PANIC_MESSAGE, Value::Null)
                .await;
        });

        PanicOutcome::CountdownStarted { seconds }
    }

    /// Stop a running countdown. Returns false if none was running.
    pub async fn cancel(&self) -> bool {
        let Some(tx) = self.cancel.lock().await.take() else {
            return false;
        };
        let _ = tx.send(true);
        info!(target: "emergency", "Panic countdown cancelled");
        if let Some(bus) = &self.bus {
            bus.emit("emergency", EventPayload::PanicCancelled).await;
        }
        true
    }
}
