use mockall::mock;
use sos_core::alert::{AlertCenter, AlertEvent, AlertSink, AlertState, ALERT_LOG_KEY};
use sos_core::audio::{AudioSink, SilentSink, TonePattern};
use sos_core::keywords::ScannerConfig;
use sos_core::{
    EventBus, EventPayload, JsonStoreExt, KeyValueStore, KeywordTable, MemoryStore, QoSLevel,
    Result, SosError, Topic,
};
use std::sync::Arc;
use std::time::Duration;

mock! {
    pub Display {}
    impl AlertSink for Display {
        fn present(&self, alert: &AlertEvent) -> Result<()>;
        fn dismiss(&self);
    }
}

mock! {
    pub Speaker {}
    impl AudioSink for Speaker {
        fn play(&self, pattern: &TonePattern) -> Result<()>;
    }
}

fn quiet_display() -> MockDisplay {
    let mut display = MockDisplay::new();
    display.expect_present().returning(|_| Ok(()));
    display.expect_dismiss().returning(|| ());
    display
}

fn center_with(
    store: Arc<dyn KeyValueStore>,
    display: MockDisplay,
    audio: Arc<dyn AudioSink>,
) -> AlertCenter {
    AlertCenter::new(
        KeywordTable::default(),
        ScannerConfig { span_chunks: true },
        store,
        Arc::new(display),
        audio,
    )
}

fn center() -> AlertCenter {
    center_with(Arc::new(MemoryStore::new()), quiet_display(), Arc::new(SilentSink))
}

#[tokio::test]
async fn keyword_chunk_raises_fire_alert() -> Result<()> {
    let mut alerts = center();
    let alert = alerts
        .process_chunk("status emg|fire detected")
        .await?
        .expect("alert raised");

    assert_eq!(alert.title, "FIRE EMERGENCY");
    assert_eq!(alert.icon, "🔥");
    assert_eq!(alert.message, "Fire emergency detected!");
    assert!(!alert.acknowledged);
    assert_eq!(
        alerts.state(),
        &AlertState::Alerting {
            alert_id: alert.id.clone()
        }
    );
    assert_eq!(alerts.alerts().len(), 1);
    Ok(())
}

#[tokio::test]
async fn table_order_beats_text_order() -> Result<()> {
    let mut alerts = center();
    let alert = alerts.process_chunk("emg|pol then emg|fire").await?.unwrap();
    assert_eq!(alert.title, "FIRE EMERGENCY");
    assert_eq!(alerts.alerts().len(), 1);
    Ok(())
}

#[tokio::test]
async fn plain_chunk_leaves_state_idle() -> Result<()> {
    let mut alerts = center();
    assert!(alerts.process_chunk("temp:22.1").await?.is_none());
    assert_eq!(alerts.state(), &AlertState::Idle);
    assert!(alerts.alerts().is_empty());
    Ok(())
}

#[tokio::test]
async fn retrigger_while_alerting_logs_and_represents() -> Result<()> {
    let mut display = MockDisplay::new();
    display.expect_present().times(2).returning(|_| Ok(()));
    display.expect_dismiss().returning(|| ());
    let mut alerts = center_with(Arc::new(MemoryStore::new()), display, Arc::new(SilentSink));

    let first = alerts.process_chunk("any1").await?.unwrap();
    let second = alerts.process_chunk("any2").await?.unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(alerts.alerts().len(), 2);
    assert_eq!(alerts.current().map(|a| a.id.clone()), Some(second.id));
    Ok(())
}

#[tokio::test]
async fn acknowledge_returns_to_idle_and_is_idempotent() -> Result<()> {
    let mut display = MockDisplay::new();
    display.expect_present().returning(|_| Ok(()));
    display.expect_dismiss().times(1).returning(|| ());
    let mut alerts = center_with(Arc::new(MemoryStore::new()), display, Arc::new(SilentSink));

    let raised = alerts.process_chunk("LAND now").await?.unwrap();
    let acked = alerts.acknowledge().await.expect("acknowledged");
    assert_eq!(acked.id, raised.id);
    assert!(acked.acknowledged);
    assert!(acked.acknowledged_at.is_some());
    assert_eq!(alerts.state(), &AlertState::Idle);

    assert!(alerts.acknowledge().await.is_none());
    assert!(alerts.acknowledge_id(&raised.id).await.is_none());
    assert_eq!(alerts.alerts()[0].acknowledged_at, acked.acknowledged_at);
    Ok(())
}

#[tokio::test]
async fn acknowledge_by_id_of_older_alert_keeps_current() -> Result<()> {
    let mut alerts = center();
    let first = alerts.process_chunk("any1").await?.unwrap();
    let second = alerts.process_chunk("any2").await?.unwrap();

    assert!(alerts.acknowledge_id(&first.id).await.is_some());
    assert_eq!(
        alerts.state(),
        &AlertState::Alerting {
            alert_id: second.id
        }
    );
    Ok(())
}

#[tokio::test]
async fn display_failure_propagates_but_alert_is_logged() -> Result<()> {
    let mut display = MockDisplay::new();
    display
        .expect_present()
        .returning(|_| Err(SosError::DisplayError("no terminal".into())));
    display.expect_dismiss().returning(|| ());
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let mut alerts = center_with(Arc::clone(&store), display, Arc::new(SilentSink));

    let err = alerts.process_chunk("any3").await;
    assert!(matches!(err, Err(SosError::DisplayError(_))));
    assert_eq!(alerts.alerts().len(), 1);
    assert!(alerts.is_alerting());

    let saved: Vec<AlertEvent> = store.get_json(ALERT_LOG_KEY)?.unwrap();
    assert_eq!(saved.len(), 1);
    Ok(())
}

#[tokio::test]
async fn audio_failure_is_swallowed() -> Result<()> {
    let mut speaker = MockSpeaker::new();
    speaker
        .expect_play()
        .times(1)
        .returning(|_| Err(SosError::AudioError("no device".into())));
    let mut alerts = center_with(Arc::new(MemoryStore::new()), quiet_display(), Arc::new(speaker));

    let alert = alerts.process_chunk("emg|amb").await?;
    assert_eq!(alert.map(|a| a.title), Some("AMBULANCE EMERGENCY".to_string()));
    Ok(())
}

#[tokio::test]
async fn log_is_capped_oldest_first() -> Result<()> {
    let mut alerts = AlertCenter::with_cap(
        KeywordTable::default(),
        ScannerConfig { span_chunks: false },
        Arc::new(MemoryStore::new()),
        Arc::new(quiet_display()),
        Arc::new(SilentSink),
        3,
    );
    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(alerts.process_chunk("any1").await?.unwrap().id);
    }
    let kept: Vec<String> = alerts.alerts().into_iter().map(|a| a.id).collect();
    assert_eq!(kept, ids[2..].to_vec());
    Ok(())
}

#[tokio::test]
async fn alerts_survive_reload() -> Result<()> {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    {
        let mut alerts = center_with(Arc::clone(&store), quiet_display(), Arc::new(SilentSink));
        alerts.process_chunk("emg|emg").await?;
        alerts.acknowledge().await;
    }
    let reloaded = center_with(store, quiet_display(), Arc::new(SilentSink));
    let logged = reloaded.alerts();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].title, "CRITICAL EMERGENCY");
    assert!(logged[0].acknowledged);
    // alerting state is not persisted
    assert_eq!(reloaded.state(), &AlertState::Idle);
    Ok(())
}

#[tokio::test]
async fn export_then_import_restores_log() -> Result<()> {
    let mut alerts = center();
    alerts.process_chunk("any1").await?;
    alerts.process_chunk("any2").await?;
    let json = alerts.export_json()?;

    alerts.clear_log();
    assert!(alerts.alerts().is_empty());

    let n = alerts.import_json(&json)?;
    assert_eq!(n, 2);
    let titles: Vec<String> = alerts.alerts().into_iter().map(|a| a.title).collect();
    assert_eq!(titles, vec!["EMERGENCY LEVEL 1", "EMERGENCY LEVEL 2"]);

    assert!(alerts.import_json("not json").is_err());
    Ok(())
}

#[tokio::test]
async fn raise_and_acknowledge_are_published() -> Result<()> {
    let bus = Arc::new(EventBus::new().await?);
    let (_sub, mut rx) = bus.subscribe(Topic::Alert, vec![], QoSLevel::Batched).await?;
    let mut alerts = center().with_bus(Arc::clone(&bus));

    alerts.process_chunk("any1").await?;
    alerts.acknowledge().await;

    let first = tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("timeout")
        .expect("channel closed");
    assert!(matches!(first.payload, EventPayload::AlertRaised(ref a) if a.keyword == "any1"));
    let second = tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("timeout")
        .expect("channel closed");
    assert_eq!(second.kind(), "alert.acknowledged");
    Ok(())
}
