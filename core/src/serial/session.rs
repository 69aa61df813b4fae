use crate::log::BoundedLog;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub timestamp: DateTime<Utc>,
    pub data: String,
}

/// What the device said this session, as decoded chunks. In memory only.
#[derive(Debug, Clone)]
pub struct SessionLog {
    entries: BoundedLog<SessionEntry>,
}

impl SessionLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: BoundedLog::new(max_entries),
        }
    }

    pub fn append(&mut self, data: &str) {
        self.entries.push(SessionEntry {
            timestamp: Utc::now(),
            data: data.to_string(),
        });
    }

    /// Write a local status line (connect/disconnect notices, read errors).
    pub fn note(&mut self, line: &str) {
        self.append(&format!("{}\n", line));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &SessionEntry> {
        self.entries.iter()
    }

    /// Everything still in the log, concatenated in arrival order.
    pub fn terminal_text(&self) -> String {
        self.entries.iter().map(|e| e.data.as_str()).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// `None` when there is nothing to save.
    pub fn export_text(&self) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }
        Some(self.terminal_text())
    }
}

/// `serial-log-YYYY-MM-DDTHH-MM-SS.txt`
pub fn export_filename(now: DateTime<Utc>) -> String {
    format!("serial-log-{}.txt", now.format("%Y-%m-%dT%H-%M-%S"))
}
