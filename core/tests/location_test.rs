use sos_core::alert::ConsoleAlertSink;
use sos_core::audio::SilentSink;
use sos_core::emergency::LoggingNotifier;
use sos_core::location::{haversine_m, GeofenceTransition, LocationFix, LocationTracker};
use sos_core::{
    CoreConfig, EventBus, KeyValueStore, KeywordTable, MemoryStore, QoSLevel, Result, Sinks,
    SosConnect, SosError, Topic,
};
use std::sync::Arc;

#[test]
fn haversine_matches_known_distance() {
    // one degree of latitude is about 111.2 km
    let d = haversine_m(0.0, 0.0, 1.0, 0.0);
    assert!((d - 111_195.0).abs() < 100.0, "got {}", d);
    assert_eq!(haversine_m(10.0, 20.0, 10.0, 20.0), 0.0);
}

#[test]
fn geofence_validation() {
    let mut tracker = LocationTracker::load(Arc::new(MemoryStore::new()), None);
    assert!(matches!(
        tracker.add_geofence("home", 0.0, 0.0, 0.0),
        Err(SosError::InvalidInput(_))
    ));
    assert!(tracker.add_geofence("home", 91.0, 0.0, 10.0).is_err());
    assert!(tracker.add_geofence("home", 0.0, -181.0, 10.0).is_err());
    assert!(tracker.add_geofence("home", 0.0, 0.0, f64::NAN).is_err());
    assert!(tracker.geofences().is_empty());
}

#[tokio::test]
async fn enter_and_exit_are_reported_once() -> Result<()> {
    let bus = Arc::new(EventBus::new().await?);
    let (_sub, mut rx) = bus.subscribe(Topic::Location, vec![], QoSLevel::Batched).await?;
    let mut tracker = LocationTracker::load(Arc::new(MemoryStore::new()), Some(bus));
    let fence = tracker.add_geofence("home", 51.5, -0.12, 200.0)?;

    let far = LocationFix::new(51.6, -0.12);
    let near = LocationFix::new(51.5005, -0.12);

    assert!(tracker.update(far.clone()).await.is_empty());
    assert_eq!(
        tracker.update(near.clone()).await,
        vec![GeofenceTransition::Entered(fence.clone())]
    );
    // staying inside reports nothing
    assert!(tracker.update(near).await.is_empty());
    assert_eq!(
        tracker.update(far).await,
        vec![GeofenceTransition::Exited(fence)]
    );

    assert_eq!(rx.recv().await.map(|e| e.kind()), Some("geofence.entered"));
    assert_eq!(rx.recv().await.map(|e| e.kind()), Some("geofence.exited"));
    assert_eq!(tracker.history().len(), 4);
    Ok(())
}

#[tokio::test]
async fn history_and_geofences_persist() -> Result<()> {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    {
        let mut tracker = LocationTracker::load(Arc::clone(&store), None);
        tracker.add_geofence("office", 40.7, -74.0, 500.0)?;
        tracker.update(LocationFix::new(40.0, -70.0)).await;
    }
    let mut tracker = LocationTracker::load(store, None);
    assert_eq!(tracker.geofences().len(), 1);
    assert_eq!(tracker.last_fix().map(|f| f.lat), Some(40.0));

    let id = tracker.geofences()[0].id.clone();
    assert!(tracker.remove_geofence(&id));
    tracker.clear_history();
    assert!(tracker.last_fix().is_none());
    Ok(())
}

#[tokio::test]
async fn emergencies_carry_the_latest_fix() -> Result<()> {
    let app = SosConnect::new(
        Arc::new(MemoryStore::new()),
        KeywordTable::default(),
        CoreConfig::default(),
        Sinks {
            alert: Arc::new(ConsoleAlertSink),
            audio: Arc::new(SilentSink),
            contacts: Arc::new(LoggingNotifier),
        },
    )
    .await?;

    app.update_location(LocationFix::new(28.6, 77.2)).await;
    let record = app
        .emergency
        .lock()
        .await
        .trigger("PANIC", "test", serde_json::Value::Null)
        .await;
    let fix = record.location.expect("location attached");
    assert_eq!((fix.lat, fix.lng), (28.6, 77.2));
    Ok(())
}
