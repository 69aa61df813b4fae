use serde::{Deserialize, Serialize};
use sos_core::{BoundedLog, JsonStoreExt, KeyValueStore, MemoryStore, PersistedLog, RocksStore, Result, SosError};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Entry {
    n: u32,
    text: String,
}

fn entry(n: u32) -> Entry {
    Entry {
        n,
        text: "x".repeat(40),
    }
}

#[test]
fn rocks_store_round_trips_and_lists_keys() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = RocksStore::open(dir.path())?;

    store.put_json("sos.a", &vec![1, 2, 3])?;
    store.put("sos.b", b"raw")?;
    assert_eq!(store.get_json::<Vec<i32>>("sos.a")?, Some(vec![1, 2, 3]));
    assert_eq!(store.keys()?, vec!["sos.a".to_string(), "sos.b".to_string()]);

    store.delete("sos.b")?;
    assert!(store.get("sos.b")?.is_none());
    Ok(())
}

#[test]
fn rocks_store_persists_across_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    {
        let store = RocksStore::open(dir.path())?;
        store.put_json("sos.settings", &serde_json::json!({ "sound": false }))?;
    }
    let store = RocksStore::open(dir.path())?;
    let v: serde_json::Value = store.get_json("sos.settings")?.unwrap();
    assert_eq!(v["sound"], false);
    Ok(())
}

#[test]
fn rocks_value_limit_reports_quota() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = RocksStore::open(dir.path())?.with_value_limit(8);
    let err = store.put("k", &[0u8; 16]);
    assert!(matches!(err, Err(SosError::QuotaExceeded { bytes: 16, .. })));
    Ok(())
}

#[test]
fn memory_quota_counts_replaced_value_once() -> Result<()> {
    let store = MemoryStore::with_quota(10);
    store.put("a", &[0u8; 8])?;
    // replacing "a" frees its 8 bytes first
    store.put("a", &[0u8; 10])?;
    assert!(store.put("b", &[0u8; 1]).is_err());
    assert_eq!(store.used_bytes(), 10);
    Ok(())
}

#[test]
fn unreadable_document_loads_empty() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    store.put("sos.log", b"{not json").unwrap();
    let log: PersistedLog<Entry> = PersistedLog::load(store, "sos.log", 10);
    assert!(log.log().is_empty());
}

#[test]
fn bounded_log_evicts_oldest() {
    let mut log = BoundedLog::new(3);
    assert!(log.push(1).is_none());
    log.push(2);
    log.push(3);
    assert_eq!(log.push(4), Some(1));
    assert_eq!(log.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
    assert_eq!(log.recent(2), vec![&4, &3]);
}

#[test]
fn persisted_log_reloads_in_order() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let mut log = PersistedLog::load(Arc::clone(&store), "sos.entries", 5);
    for n in 0..7 {
        log.push(entry(n));
    }
    let reloaded: PersistedLog<Entry> = PersistedLog::load(store, "sos.entries", 5);
    let ns: Vec<u32> = reloaded.log().iter().map(|e| e.n).collect();
    assert_eq!(ns, vec![2, 3, 4, 5, 6]);
}

#[test]
fn quota_error_halves_persisted_window() {
    // each serialized entry is a bit over 50 bytes
    let store = Arc::new(MemoryStore::with_quota(300));
    let mut log = PersistedLog::load(Arc::clone(&store) as Arc<dyn KeyValueStore>, "sos.entries", 100);
    for n in 0..20 {
        log.log_mut().push(entry(n));
    }

    let persisted = log.save();
    // 20 -> 10 -> 5 entries; 5 fit
    assert_eq!(persisted, 5);
    assert_eq!(log.log().len(), 20);

    let saved: Vec<Entry> = store.get_json("sos.entries").unwrap().unwrap();
    let ns: Vec<u32> = saved.iter().map(|e| e.n).collect();
    assert_eq!(ns, vec![15, 16, 17, 18, 19]);
}

#[test]
fn persist_window_limits_what_is_written() {
    let store = Arc::new(MemoryStore::new());
    let mut log = PersistedLog::load(Arc::clone(&store) as Arc<dyn KeyValueStore>, "sos.entries", 10)
        .with_persist_window(3);
    for n in 0..6 {
        log.push(entry(n));
    }
    let saved: Vec<Entry> = store.get_json("sos.entries").unwrap().unwrap();
    assert_eq!(saved.len(), 3);
    assert_eq!(saved[0].n, 3);
    assert_eq!(log.log().len(), 6);
}
