use crate::util::gen_id;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub relationship: String,
    pub is_primary: bool,
    pub notify_by_sms: bool,
    pub notify_by_email: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for [`ContactBook::add`]. Both notification channels default on.
#[derive(Debug, Clone)]
pub struct NewContact {
    pub name: String,
    pub phone: String,
    pub email: String,
    pub relationship: String,
    pub is_primary: bool,
    pub notify_by_sms: bool,
    pub notify_by_email: bool,
}

impl NewContact {
    pub fn new(name: &str, phone: &str) -> Self {
        Self {
            name: name.to_string(),
            phone: phone.to_string(),
            email: String::new(),
            relationship: String::new(),
            is_primary: false,
            notify_by_sms: true,
            notify_by_email: true,
        }
    }

    pub fn email(mut self, email: &str) -> Self {
        self.email = email.to_string();
        self
    }

    pub fn relationship(mut self, relationship: &str) -> Self {
        self.relationship = relationship.to_string();
        self
    }

    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }
}

/// Partial update; `None` leaves the field alone.
#[derive(Debug, Clone, Default)]
pub struct ContactUpdate {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub relationship: Option<String>,
    pub is_primary: Option<bool>,
    pub notify_by_sms: Option<bool>,
    pub notify_by_email: Option<bool>,
}

/// Contact list with at most one primary.
#[derive(Debug, Clone, Default)]
pub struct ContactBook {
    contacts: Vec<Contact>,
}

impl ContactBook {
    pub fn from_contacts(contacts: Vec<Contact>) -> Self {
        Self { contacts }
    }

    pub fn all(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn get(&self, id: &str) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.id == id)
    }

    pub fn add(&mut self, new: NewContact) -> Contact {
        let contact = Contact {
            id: gen_id("contact"),
            name: new.name,
            phone: new.phone,
            email: new.email,
            relationship: new.relationship,
            is_primary: new.is_primary,
            notify_by_sms: new.notify_by_sms,
            notify_by_email: new.notify_by_email,
            created_at: Utc::now(),
        };
        if contact.is_primary {
            self.contacts.iter_mut().for_each(|c| c.is_primary = false);
        }
        self.contacts.push(contact.clone());
        contact
    }

    pub fn update(&mut self, id: &str, update: ContactUpdate) -> Option<Contact> {
        if update.is_primary == Some(true) {
            self.contacts
                .iter_mut()
                .filter(|c| c.id != id)
                .for_each(|c| c.is_primary = false);
        }
        let contact = self.contacts.iter_mut().find(|c| c.id == id)?;
        if let Some(v) = update.name {
            contact.name = v;
        }
        if let Some(v) = update.phone {
            contact.phone = v;
        }
        if let Some(v) = update.email {
            contact.email = v;
        }
        if let Some(v) = update.relationship {
            contact.relationship = v;
        }
        if let Some(v) = update.is_primary {
            contact.is_primary = v;
        }
        if let Some(v) = update.notify_by_sms {
            contact.notify_by_sms = v;
        }
        if let Some(v) = update.notify_by_email {
            contact.notify_by_email = v;
        }
        Some(contact.clone())
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.contacts.len();
        self.contacts.retain(|c| c.id != id);
        self.contacts.len() != before
    }

    /// The flagged primary, else the first contact.
    pub fn primary(&self) -> Option<&Contact> {
        self.contacts
            .iter()
            .find(|c| c.is_primary)
            .or_else(|| self.contacts.first())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Sms,
    Email,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

/// Outcome of notifying one contact on one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub contact_id: String,
    pub channel: Channel,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outbound SMS/email gateway.
#[async_trait]
pub trait ContactNotifier: Send + Sync {
    async fn send_sms(&self, contact: &Contact, message: &str) -> Result<()>;
    async fn send_email(&self, contact: &Contact, subject: &str, message: &str) -> Result<()>;
}

/// Records what would be sent without talking to any gateway.
#[derive(Debug, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl ContactNotifier for LoggingNotifier {
    async fn send_sms(&self, contact: &Contact, message: &str) -> Result<()> {
        info!(target: "emergency", to = %contact.phone, name = %contact.name, message, "SMS notification");
        Ok(())
    }

    async fn send_email(&self, contact: &Contact, subject: &str, message: &str) -> Result<()> {
        info!(target: "emergency", to = %contact.email, subject, message, "Email notification");
        Ok(())
    }
}
