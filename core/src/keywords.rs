//! Emergency keyword table and chunk scanner.
//!
//! Matching is case-insensitive substring containment. The table is walked in
//! declaration order and the first entry that matches wins; any further
//! matches in the same chunk are ignored, so one chunk raises at most one
//! alert. There is no severity ranking.

use crate::{Result, SosError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Display metadata for one trigger keyword.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordEntry {
    pub keyword: String,
    pub title: String,
    pub icon: String,
    pub message: String,
    pub color: String,
}

impl KeywordEntry {
    pub fn new(keyword: &str, title: &str, icon: &str, message: &str, color: &str) -> Self {
        Self {
            keyword: keyword.to_lowercase(),
            title: title.to_string(),
            icon: icon.to_string(),
            message: message.to_string(),
            color: color.to_string(),
        }
    }
}

/// Ordered keyword -> metadata table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordTable {
    entries: Vec<KeywordEntry>,
}

impl Default for KeywordTable {
    fn default() -> Self {
        Self {
            entries: vec![
                KeywordEntry::new("land", "LANDING EMERGENCY", "🛬", "Emergency landing detected!", "#ef4444"),
                KeywordEntry::new("any1", "EMERGENCY LEVEL 1", "🚨", "Priority 1 emergency detected!", "#f97316"),
                KeywordEntry::new("any2", "EMERGENCY LEVEL 2", "⚠️", "Priority 2 emergency detected!", "#eab308"),
                KeywordEntry::new("any3", "EMERGENCY LEVEL 3", "⚡", "Priority 3 emergency detected!", "#dc2626"),
                KeywordEntry::new("emg|amb", "AMBULANCE EMERGENCY", "🚑", "Ambulance emergency detected!", "#dc2626"),
                KeywordEntry::new("emg|fire", "FIRE EMERGENCY", "🔥", "Fire emergency detected!", "#ff4500"),
                KeywordEntry::new("emg|pol", "POLICE EMERGENCY", "👮", "Police emergency detected!", "#1e40af"),
                KeywordEntry::new("emg|emg", "CRITICAL EMERGENCY", "🆘", "Critical emergency situation!", "#b91c1c"),
            ],
        }
    }
}

impl KeywordTable {
    /// Build a table from entries in the given order.
    ///
    /// Keywords are lowercased. Empty or duplicate keywords are rejected.
    pub fn from_entries(entries: Vec<KeywordEntry>) -> Result<Self> {
        let mut normalized: Vec<KeywordEntry> = Vec::with_capacity(entries.len());
        for mut entry in entries {
            entry.keyword = entry.keyword.trim().to_lowercase();
            if entry.keyword.is_empty() {
                return Err(SosError::InvalidInput(format!(
                    "empty keyword for alert '{}'",
                    entry.title
                )));
            }
            if normalized.iter().any(|e| e.keyword == entry.keyword) {
                return Err(SosError::InvalidInput(format!(
                    "duplicate keyword '{}'",
                    entry.keyword
                )));
            }
            normalized.push(entry);
        }
        Ok(Self {
            entries: normalized,
        })
    }

    pub fn entries(&self) -> &[KeywordEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, keyword: &str) -> Option<&KeywordEntry> {
        let keyword = keyword.to_lowercase();
        self.entries.iter().find(|e| e.keyword == keyword)
    }

    /// Length in chars of the longest keyword.
    pub fn max_keyword_chars(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.keyword.chars().count())
            .max()
            .unwrap_or(0)
    }

    /// First entry, in table order, whose keyword occurs in `text`.
    pub fn scan(&self, text: &str) -> Option<&KeywordEntry> {
        let lower = text.to_lowercase();
        self.entries.iter().find(|e| lower.contains(&e.keyword))
    }

    /// Every matching entry, in table order.
    pub fn matches(&self, text: &str) -> Vec<&KeywordEntry> {
        let lower = text.to_lowercase();
        self.entries
            .iter()
            .filter(|e| lower.contains(&e.keyword))
            .collect()
    }

    /// Scan `window` (already lowercased) for the first entry whose match
    /// ends past byte offset `boundary`.
    fn scan_after(&self, window: &str, boundary: usize) -> Option<&KeywordEntry> {
        self.entries.iter().find(|e| {
            window
                .match_indices(e.keyword.as_str())
                .any(|(start, m)| start + m.len() > boundary)
        })
    }
}

/// Scanner behavior.
#[derive(Clone, Debug)]
pub struct ScannerConfig {
    /// Detect keywords split across two consecutive chunks.
    pub span_chunks: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            span_chunks: std::env::var("SOS_SPAN_CHUNKS")
                .ok()
                .map(|s| matches!(s.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
                .unwrap_or(true),
        }
    }
}

/// Stateful per-stream scanner.
///
/// With `span_chunks` on, the tail of the previous chunk is kept so a keyword
/// cut by a chunk boundary still matches. A match only counts if it ends
/// inside the new chunk, so a keyword never fires twice.
#[derive(Debug, Clone)]
pub struct ChunkScanner {
    table: KeywordTable,
    span_chunks: bool,
    carry: String,
}

impl ChunkScanner {
    pub fn new(table: KeywordTable, cfg: ScannerConfig) -> Self {
        Self {
            table,
            span_chunks: cfg.span_chunks,
            carry: String::new(),
        }
    }

    pub fn table(&self) -> &KeywordTable {
        &self.table
    }

    /// Drop any carried tail (e.g. on reconnect).
    pub fn reset(&mut self) {
        self.carry.clear();
    }

    pub fn scan_chunk(&mut self, chunk: &str) -> Option<KeywordEntry> {
        if !self.span_chunks {
            return self.table.scan(chunk).cloned();
        }

        let lower = chunk.to_lowercase();
        let boundary = self.carry.len();
        let mut window = std::mem::take(&mut self.carry);
        window.push_str(&lower);

        let hit = self.table.scan_after(&window, boundary).cloned();
        if let Some(ref entry) = hit {
            let suppressed: Vec<&str> = self
                .table
                .matches(&window[boundary..])
                .into_iter()
                .map(|e| e.keyword.as_str())
                .filter(|k| *k != entry.keyword)
                .collect();
            if !suppressed.is_empty() {
                debug!(target: "alert", winner = %entry.keyword, ?suppressed, "Additional keywords in chunk ignored");
            }
        }

        let keep = self.table.max_keyword_chars().saturating_sub(1);
        self.carry = tail_chars(&window, keep).to_string();
        hit
    }
}

/// Last `n` chars of `s`.
fn tail_chars(s: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    match s.char_indices().rev().nth(n - 1) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_chars_respects_char_boundaries() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 5), "ab");
        assert_eq!(tail_chars("xé🔥", 2), "é🔥");
        assert_eq!(tail_chars("abc", 0), "");
    }

    #[test]
    fn scan_after_ignores_matches_inside_carry() {
        let table = KeywordTable::default();
        // "land" sits entirely before the boundary
        assert!(table.scan_after("landxx", 4).is_none());
        // a match crossing the boundary counts
        let hit = table.scan_after("land", 3).map(|e| e.keyword.as_str());
        assert_eq!(hit, Some("land"));
    }
}
