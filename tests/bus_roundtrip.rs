//! Bus round-trip tests.
//!
//! Exercises the embedded server and client end to end: publish/subscribe
//! preservation of scalar and composite points, wildcard patterns,
//! subscription release and batched async publishing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fluxgate::bus::{BatchConfig, BatchPublisher, BusClient, BusMessage, BusServer};
use fluxgate::types::{DataPoint, DataType, Value, Vector3d};

async fn start_bus(cancel: &CancellationToken) -> (BusServer, BusClient) {
    let server = BusServer::start("127.0.0.1", 0, 0, cancel.child_token())
        .await
        .expect("embedded bus");
    let addr = format!("127.0.0.1:{}", server.local_addr().port());
    let client = BusClient::connect(&addr, cancel.clone())
        .await
        .expect("bus client");
    (server, client)
}

/// Subscribe and collect matching messages into a channel.
async fn collect(client: &BusClient, pattern: &str) -> (fluxgate::Subscription, mpsc::Receiver<BusMessage>) {
    let (tx, rx) = mpsc::channel(64);
    let handler: fluxgate::bus::MessageHandler = Arc::new(move |msg| {
        let _ = tx.try_send(msg);
    });
    let sub = client.subscribe(pattern, handler).await.expect("subscribe");
    (sub, rx)
}

async fn recv_within(rx: &mut mpsc::Receiver<BusMessage>, ms: u64) -> BusMessage {
    tokio::time::timeout(Duration::from_millis(ms), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed")
}

#[tokio::test]
async fn scalar_point_round_trips_bit_exact() {
    let cancel = CancellationToken::new();
    let (server, client) = start_bus(&cancel).await;

    let (sub, mut rx) = collect(&client, "iot.data.>").await;

    let point = DataPoint::new("dev-1", "temperature", Value::Float(21.625)).unwrap();
    let payload = serde_json::to_vec(&point).unwrap();
    client.publish(&point.subject(), &payload).await.unwrap();

    let msg = recv_within(&mut rx, 1_000).await;
    assert_eq!(msg.subject, "iot.data.dev-1.temperature");
    let back: DataPoint = serde_json::from_slice(&msg.payload).unwrap();
    assert_eq!(back.key, point.key);
    assert_eq!(back.device_id, point.device_id);
    assert_eq!(back.value, Value::Float(21.625));
    assert_eq!(back.quality, 0);

    sub.release().await;
    cancel.cancel();
    server.shutdown().await;
}

#[tokio::test]
async fn composite_round_trip_preserves_derived_tags() {
    let cancel = CancellationToken::new();
    let (server, client) = start_bus(&cancel).await;
    let (sub, mut rx) = collect(&client, "iot.data.imu-1.*").await;

    let point = DataPoint::new(
        "imu-1",
        "accel",
        Value::Vector3d(Vector3d { x: 3.0, y: 4.0, z: 0.0 }),
    )
    .unwrap();
    let payload = serde_json::to_vec(&point).unwrap();
    client.publish(&point.subject(), &payload).await.unwrap();

    let msg = recv_within(&mut rx, 1_000).await;
    let back: DataPoint = serde_json::from_slice(&msg.payload).unwrap();
    assert_eq!(back.data_type(), DataType::Vector3d);
    assert_eq!(back.value, point.value);
    assert!(back
        .tags
        .get("derived.magnitude")
        .unwrap()
        .starts_with("5.0"));

    sub.release().await;
    cancel.cancel();
    server.shutdown().await;
}

#[tokio::test]
async fn wildcards_match_token_wise() {
    let cancel = CancellationToken::new();
    let (server, client) = start_bus(&cancel).await;

    let (star_sub, mut star_rx) = collect(&client, "iot.data.*.rpm").await;
    let (tail_sub, mut tail_rx) = collect(&client, "iot.data.>").await;

    let point = DataPoint::new("pump-2", "rpm", Value::Int(1_480)).unwrap();
    let payload = serde_json::to_vec(&point).unwrap();
    client.publish("iot.data.pump-2.rpm", &payload).await.unwrap();
    // Deeper subject: only the tail wildcard sees it.
    client
        .publish("iot.data.pump-2.motor.rpm", &payload)
        .await
        .unwrap();

    let first = recv_within(&mut star_rx, 1_000).await;
    assert_eq!(first.subject, "iot.data.pump-2.rpm");
    assert!(
        tokio::time::timeout(Duration::from_millis(200), star_rx.recv())
            .await
            .is_err(),
        "single-token wildcard must not match the deeper subject"
    );

    let a = recv_within(&mut tail_rx, 1_000).await;
    let b = recv_within(&mut tail_rx, 1_000).await;
    assert_eq!(a.subject, "iot.data.pump-2.rpm");
    assert_eq!(b.subject, "iot.data.pump-2.motor.rpm");

    star_sub.release().await;
    tail_sub.release().await;
    cancel.cancel();
    server.shutdown().await;
}

#[tokio::test]
async fn released_subscription_stops_delivery() {
    let cancel = CancellationToken::new();
    let (server, client) = start_bus(&cancel).await;
    let (sub, mut rx) = collect(&client, "lab.>").await;

    client.publish("lab.a", b"one").await.unwrap();
    recv_within(&mut rx, 1_000).await;

    sub.release().await;
    // Give the broker a beat to process the UNSUB frame.
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.publish("lab.a", b"two").await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err(),
        "released subscription must not receive"
    );

    cancel.cancel();
    server.shutdown().await;
}

#[tokio::test]
async fn batch_publisher_flushes_by_size_and_timer() {
    let cancel = CancellationToken::new();
    let (server, client) = start_bus(&cancel).await;
    let (sub, mut rx) = collect(&client, "batch.>").await;

    let publisher = BatchPublisher::new(
        client.clone(),
        BatchConfig {
            batch_size: 10,
            flush_interval: Duration::from_millis(20),
            queue_capacity: 64,
        },
        cancel.clone(),
    );

    // Timer-driven flush: fewer than batch_size messages still arrive.
    for i in 0..3 {
        publisher
            .publish_async("batch.timer", format!("m{i}").as_bytes())
            .await
            .unwrap();
    }
    for _ in 0..3 {
        recv_within(&mut rx, 1_000).await;
    }

    // Size-driven flush: a burst arrives intact and in order.
    for i in 0..25 {
        publisher
            .publish_async("batch.burst", format!("b{i}").as_bytes())
            .await
            .unwrap();
    }
    for i in 0..25 {
        let msg = recv_within(&mut rx, 1_000).await;
        assert_eq!(msg.payload, format!("b{i}").into_bytes());
    }

    sub.release().await;
    cancel.cancel();
    server.shutdown().await;
}

#[tokio::test]
async fn per_subject_ordering_preserved() {
    let cancel = CancellationToken::new();
    let (server, client) = start_bus(&cancel).await;
    let (sub, mut rx) = collect(&client, "ordered.stream").await;

    for i in 0..100u32 {
        client
            .publish("ordered.stream", &i.to_be_bytes())
            .await
            .unwrap();
    }
    for i in 0..100u32 {
        let msg = recv_within(&mut rx, 1_000).await;
        assert_eq!(msg.payload, i.to_be_bytes());
    }

    sub.release().await;
    cancel.cancel();
    server.shutdown().await;
}
