//! Emergency desk: contacts, dispatch records and the panic button.

mod contacts;
mod panic;

pub use contacts::{
    Channel, Contact, ContactBook, ContactNotifier, ContactUpdate, Delivery, DeliveryStatus,
    LoggingNotifier, NewContact,
};
pub use panic::{PanicButton, PanicConfig, PanicOutcome};

use crate::audio::{AudioSink, TonePattern};
use crate::event::{EventBus, EventPayload};
use crate::location::LocationFix;
use crate::log::PersistedLog;
use crate::storage::{load_or_default, save_or_log, KeyValueStore};
use crate::util::gen_id;
use crate::{Result, SosError};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

pub const CONTACTS_KEY: &str = "sos.contacts";
pub const EVENTS_KEY: &str = "sos.emergency_events";
pub const MAX_EVENTS: usize = 100;

const EMAIL_SUBJECT: &str = "EMERGENCY ALERT from SOS Connect";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyRecord {
    pub id: String,
    /// `PANIC`, `CALL`, or whatever the caller passed to `trigger`.
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub location: Option<LocationFix>,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default)]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub contacts_notified: Vec<Delivery>,
}

impl EmergencyRecord {
    fn new(prefix: &str, kind: &str, message: &str, data: Value) -> Self {
        Self {
            id: gen_id(prefix),
            kind: kind.to_string(),
            message: message.to_string(),
            data,
            timestamp: Utc::now(),
            location: None,
            acknowledged: false,
            acknowledged_at: None,
            contacts_notified: Vec::new(),
        }
    }
}

/// Text sent to contacts for `record`.
pub fn format_message(record: &EmergencyRecord) -> String {
    let mut message = String::from("EMERGENCY ALERT!\n");
    message.push_str(&format!("Type: {}\n", record.kind));
    message.push_str(&format!("Message: {}\n", record.message));
    message.push_str(&format!(
        "Time: {}\n",
        record.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
    ));
    if let Some(fix) = &record.location {
        message.push_str(&format!("Location: {}\n", fix.maps_url()));
    }
    message.push_str("\n- Sent from SOS Connect");
    message
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmergencyService {
    Police,
    Ambulance,
    Fire,
    Women,
    Child,
    Disaster,
    Universal,
}

impl EmergencyService {
    pub const ALL: [EmergencyService; 7] = [
        EmergencyService::Police,
        EmergencyService::Ambulance,
        EmergencyService::Fire,
        EmergencyService::Women,
        EmergencyService::Child,
        EmergencyService::Disaster,
        EmergencyService::Universal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmergencyService::Police => "police",
            EmergencyService::Ambulance => "ambulance",
            EmergencyService::Fire => "fire",
            EmergencyService::Women => "women",
            EmergencyService::Child => "child",
            EmergencyService::Disaster => "disaster",
            EmergencyService::Universal => "universal",
        }
    }

    pub fn number(&self) -> &'static str {
        match self {
            EmergencyService::Police => "100",
            EmergencyService::Ambulance => "102",
            EmergencyService::Fire => "101",
            EmergencyService::Women => "1091",
            EmergencyService::Child => "1098",
            EmergencyService::Disaster => "108",
            EmergencyService::Universal => "112",
        }
    }
}

impl FromStr for EmergencyService {
    type Err = SosError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|svc| svc.as_str() == s)
            .ok_or_else(|| SosError::InvalidInput(format!("unknown emergency service {:?}", s)))
    }
}

impl fmt::Display for EmergencyService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct EmergencyDesk {
    contacts: ContactBook,
    events: PersistedLog<EmergencyRecord>,
    notifier: Arc<dyn ContactNotifier>,
    audio: Arc<dyn AudioSink>,
    sound_enabled: bool,
    location: Option<LocationFix>,
    store: Arc<dyn KeyValueStore>,
    bus: Option<Arc<EventBus>>,
}

impl EmergencyDesk {
    pub fn load(
        store: Arc<dyn KeyValueStore>,
        notifier: Arc<dyn ContactNotifier>,
        audio: Arc<dyn AudioSink>,
        bus: Option<Arc<EventBus>>,
    ) -> Self {
        let contacts: Vec<Contact> = load_or_default(store.as_ref(), CONTACTS_KEY, "emergency");
        Self {
            contacts: ContactBook::from_contacts(contacts),
            events: PersistedLog::load(Arc::clone(&store), EVENTS_KEY, MAX_EVENTS),
            notifier,
            audio,
            sound_enabled: true,
            location: None,
            store,
            bus,
        }
    }

    pub fn set_sound_enabled(&mut self, enabled: bool) {
        self.sound_enabled = enabled;
    }

    /// Last known position, attached to subsequent emergency records.
    pub fn set_location(&mut self, fix: Option<LocationFix>) {
        self.location = fix;
    }

    pub fn contacts(&self) -> &[Contact] {
        self.contacts.all()
    }

    pub fn primary_contact(&self) -> Option<&Contact> {
        self.contacts.primary()
    }

    pub fn add_contact(&mut self, new: NewContact) -> Result<Contact> {
        if new.name.trim().is_empty() || new.phone.trim().is_empty() {
            return Err(SosError::InvalidInput(
                "contact needs a name and a phone number".into(),
            ));
        }
        let contact = self.contacts.add(new);
        self.save_contacts();
        Ok(contact)
    }

    pub fn update_contact(&mut self, id: &str, update: ContactUpdate) -> Result<Contact> {
        let contact = self
            .contacts
            .update(id, update)
            .ok_or_else(|| SosError::NotFound(format!("contact {}", id)))?;
        self.save_contacts();
        Ok(contact)
    }

    pub fn delete_contact(&mut self, id: &str) -> bool {
        let removed = self.contacts.remove(id);
        if removed {
            self.save_contacts();
        }
        removed
    }

    pub(crate) fn play(&self, pattern: &TonePattern) {
        if !self.sound_enabled {
            return;
        }
        if let Err(e) = self.audio.play(pattern) {
            warn!(target: "emergency", error = %e, "Sound error");
        }
    }

    /// Record an emergency, notify every contact on their enabled channels
    /// and publish the result. Delivery failures are recorded, not returned.
    pub async fn trigger(&mut self, kind: &str, message: &str, data: Value) -> EmergencyRecord {
        let mut record = EmergencyRecord::new("emergency", kind, message, data);
        record.location = self.location.clone();
        info!(target: "emergency", kind, message, "Emergency triggered");

        let text = format_message(&record);
        for contact in self.contacts.all() {
            if contact.notify_by_sms && !contact.phone.is_empty() {
                let outcome = self.notifier.send_sms(contact, &text).await;
                record
                    .contacts_notified
                    .push(delivery(contact, Channel::Sms, outcome));
            }
            if contact.notify_by_email && !contact.email.is_empty() {
                let outcome = self.notifier.send_email(contact, EMAIL_SUBJECT, &text).await;
                record
                    .contacts_notified
                    .push(delivery(contact, Channel::Email, outcome));
            }
        }

        self.events.push(record.clone());
        if let Some(bus) = &self.bus {
            bus.emit("emergency", EventPayload::EmergencyTriggered(record.clone()))
                .await;
        }
        self.play(&TonePattern::siren());
        record
    }

    /// Log a call to an emergency service. Returns the number to dial.
    pub fn dial(&mut self, service: EmergencyService) -> (&'static str, EmergencyRecord) {
        let number = service.number();
        let record = EmergencyRecord::new(
            "event",
            "CALL",
            &format!("Dialed {}: {}", service, number),
            Value::Null,
        );
        info!(target: "emergency", %service, number, "Dialing emergency service");
        self.events.push(record.clone());
        (number, record)
    }

    pub async fn acknowledge(&mut self, id: &str) -> Option<EmergencyRecord> {
        let record = self.events.log_mut().iter_mut().find(|e| e.id == id)?;
        if record.acknowledged {
            return Some(record.clone());
        }
        record.acknowledged = true;
        record.acknowledged_at = Some(Utc::now());
        let record = record.clone();
        self.events.save();
        if let Some(bus) = &self.bus {
            bus.emit("emergency", EventPayload::EmergencyAcknowledged(record.clone()))
                .await;
        }
        Some(record)
    }

    /// Newest first.
    pub fn events(&self, limit: usize) -> Vec<EmergencyRecord> {
        self.events.log().recent(limit).into_iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    fn save_contacts(&self) {
        save_or_log(self.store.as_ref(), CONTACTS_KEY, self.contacts.all(), "emergency");
    }
}

fn delivery(contact: &Contact, channel: Channel, outcome: Result<()>) -> Delivery {
    match outcome {
        Ok(()) => Delivery {
            contact_id: contact.id.clone(),
            channel,
            status: DeliveryStatus::Sent,
            error: None,
        },
        Err(e) => {
            warn!(target: "emergency", contact = %contact.name, ?channel, error = %e, "Delivery failed");
            Delivery {
                contact_id: contact.id.clone(),
                channel,
                status: DeliveryStatus::Failed,
                error: Some(e.to_string()),
            }
        }
    }
}
