use sos_core::audio::{AudioSink, TonePattern};
use sos_core::notify::{NotificationCenter, NotificationKind};
use sos_core::{KeyValueStore, MemoryStore, Result};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Recorder {
    played: Mutex<Vec<String>>,
}

impl AudioSink for Recorder {
    fn play(&self, pattern: &TonePattern) -> Result<()> {
        self.played.lock().unwrap().push(pattern.name.clone());
        Ok(())
    }
}

fn center() -> (NotificationCenter, Arc<Recorder>) {
    let audio = Arc::new(Recorder::default());
    let center = NotificationCenter::load(
        Arc::new(MemoryStore::new()),
        Arc::clone(&audio) as Arc<dyn AudioSink>,
        None,
    );
    (center, audio)
}

#[tokio::test]
async fn each_kind_plays_its_own_tone() {
    let (mut center, audio) = center();
    center
        .show(NotificationKind::Info, "Hello", "body", "ℹ️", serde_json::Value::Null)
        .await;
    center.show_emergency("SOS", "help", serde_json::Value::Null).await;
    center.show_sensor_warning("temp", 41.0, 40.0).await;
    center.show_connection_status(true, "connected").await;

    let played = audio.played.lock().unwrap().clone();
    let expected: Vec<String> = [
        TonePattern::notification_default(),
        TonePattern::notification_emergency(),
        TonePattern::notification_warning(),
        TonePattern::notification_success(),
    ]
    .into_iter()
    .map(|p| p.name)
    .collect();
    assert_eq!(played, expected);
}

#[tokio::test]
async fn muted_center_stays_silent() {
    let (mut center, audio) = center();
    center.set_sound_enabled(false);
    assert!(!center.sound_enabled());
    center.show_emergency("SOS", "help", serde_json::Value::Null).await;
    assert!(audio.played.lock().unwrap().is_empty());
    assert_eq!(center.history(10).len(), 1);
}

#[tokio::test]
async fn read_state_and_history() {
    let (mut center, _) = center();
    let first = center.show_connection_status(false, "gone").await;
    center.show_sensor_warning("hum", 95.0, 90.0).await;
    assert_eq!(center.unread_count(), 2);

    let history = center.history(10);
    assert_eq!(history[0].title, "Sensor Warning");
    assert_eq!(history[0].body, "hum reading 95 exceeded threshold 90");
    assert_eq!(history[1].kind, NotificationKind::Info);

    assert!(center.mark_read(&first.id));
    assert!(!center.mark_read("missing"));
    assert_eq!(center.unread_count(), 1);
    center.mark_all_read();
    assert_eq!(center.unread_count(), 0);

    center.clear();
    assert!(center.history(10).is_empty());
}

#[tokio::test]
async fn history_survives_reload() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let audio: Arc<dyn AudioSink> = Arc::new(Recorder::default());
    {
        let mut center = NotificationCenter::load(Arc::clone(&store), Arc::clone(&audio), None);
        let n = center.show_emergency("SOS", "help", serde_json::Value::Null).await;
        center.mark_read(&n.id);
    }
    let center = NotificationCenter::load(store, audio, None);
    let history = center.history(10);
    assert_eq!(history.len(), 1);
    assert!(history[0].read);
}
