use sos_core::event::EventBus;
use sos_core::{Event, EventPayload, QoSLevel, Result, Topic};
use std::time::Duration;

fn chunk(text: &str) -> Event {
    Event::new("test", EventPayload::ChunkReceived { text: text.to_string() })
}

#[tokio::test]
async fn subscribe_and_publish_basic() -> Result<()> {
    let bus = EventBus::new().await?;
    let (_sub_id, mut rx) = bus.subscribe(Topic::Serial, vec![], QoSLevel::Batched).await?;

    let delivered = bus.publish(chunk("hello")).await?;
    assert_eq!(delivered, 1);

    let received = tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("timeout")
        .expect("channel closed");
    assert!(matches!(received.payload, EventPayload::ChunkReceived { ref text } if text == "hello"));
    assert_eq!(received.source, "test");
    Ok(())
}

#[tokio::test]
async fn payload_picks_its_topic() -> Result<()> {
    let bus = EventBus::new().await?;
    let (_a, mut alert_rx) = bus.subscribe(Topic::Alert, vec![], QoSLevel::Batched).await?;

    // serial events do not reach alert subscribers
    assert_eq!(bus.publish(chunk("x")).await?, 0);
    let none = tokio::time::timeout(Duration::from_millis(100), alert_rx.recv()).await;
    assert!(none.is_err());
    Ok(())
}

#[tokio::test]
async fn unsubscribe_stops_receiving_events() -> Result<()> {
    let bus = EventBus::new().await?;
    let (sub_id, mut rx) = bus.subscribe(Topic::Serial, vec![], QoSLevel::Batched).await?;

    bus.publish(chunk("before")).await?;
    bus.unsubscribe(&sub_id).await?;
    bus.publish(chunk("after")).await?;

    let first = tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("timeout")
        .expect("channel closed");
    assert!(matches!(first.payload, EventPayload::ChunkReceived { ref text } if text == "before"));

    let second = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(
        second.is_err() || second.unwrap().is_none(),
        "should not receive after unsubscribe"
    );
    Ok(())
}

#[tokio::test]
async fn event_type_filtering_works() -> Result<()> {
    let bus = EventBus::new().await?;
    let (_sub_id, mut rx) = bus
        .subscribe(
            Topic::Serial,
            vec!["serial.disconnected".to_string()],
            QoSLevel::Batched,
        )
        .await?;

    bus.publish(chunk("ignored")).await?;
    bus.emit(
        "test",
        EventPayload::SerialDisconnected {
            source: "stdin".into(),
            reason: "end of stream".into(),
        },
    )
    .await;

    let got = tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("timeout")
        .expect("channel closed");
    assert_eq!(got.kind(), "serial.disconnected");
    Ok(())
}

#[tokio::test]
async fn realtime_drops_under_pressure_and_counters_update() -> Result<()> {
    let bus = EventBus::new().await?;
    let (_sub_id, mut rx) = bus.subscribe(Topic::Serial, vec![], QoSLevel::Realtime).await?;

    // never drained, so the 64-slot queue fills
    for i in 0..1000u32 {
        bus.publish(chunk(&format!("c{}", i))).await?;
    }
    let _ = rx.try_recv().ok();

    let stats = bus.get_stats(Topic::Serial).expect("stats exist");
    assert!(stats.total_published >= 1000);
    assert!(stats.dropped_events > 0, "expected drops for realtime under backpressure");
    assert_eq!(stats.active_subscriptions, 1);
    Ok(())
}

#[tokio::test]
async fn batched_keeps_every_event_in_order() -> Result<()> {
    let bus = EventBus::new().await?;
    let (_sub_id, mut rx) = bus.subscribe(Topic::Serial, vec![], QoSLevel::Batched).await?;

    for i in 0..200u32 {
        bus.publish(chunk(&i.to_string())).await?;
    }
    for i in 0..200u32 {
        let ev = rx.recv().await.expect("event");
        assert!(matches!(ev.payload, EventPayload::ChunkReceived { ref text } if *text == i.to_string()));
    }
    let stats = bus.get_stats(Topic::Serial).expect("stats exist");
    assert_eq!(stats.dropped_events, 0);
    assert_eq!(stats.backlog_size, 0);
    Ok(())
}

#[tokio::test]
async fn shutdown_clears_subscriptions() -> Result<()> {
    let bus = EventBus::new().await?;
    let (_sub_id, mut rx) = bus.subscribe(Topic::Serial, vec![], QoSLevel::Batched).await?;
    bus.shutdown().await?;
    assert_eq!(bus.publish(chunk("late")).await?, 0);
    assert!(rx.recv().await.is_none());
    Ok(())
}

#[test]
fn payload_serializes_with_kind_tag() {
    let ev = chunk("abc");
    let json = serde_json::to_value(&ev).unwrap();
    assert_eq!(json["payload"]["kind"], "ChunkReceived");
    assert_eq!(json["payload"]["data"]["text"], "abc");
}
