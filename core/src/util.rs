//! Shared id/time helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since UNIX epoch.
#[inline]
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Generate an id of the form `<prefix>-<hex nanos>`.
///
/// A process-wide counter is mixed in so two ids minted within the same
/// clock tick still differ.
pub(crate) fn gen_id(prefix: &str) -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SEQ: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{:x}{:04x}", prefix, nanos, seq & 0xffff)
}
