//! Presence propagation between buses and causal signal delivery.

use mb_test_utils::{init_tracing, linked_pair};
use mesh_bus::{BusOptions, Handler, ListenOptions, MessageBus, SignalEvent};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::mpsc;

fn presence_events(bus: &MessageBus) -> mpsc::UnboundedReceiver<(String, Value)> {
    let (tx, rx) = mpsc::unbounded_channel();
    bus.on(
        "presence:*",
        Handler::sync(move |ev| {
            let _ = tx.send((ev.name.clone(), ev.data.clone()));
        }),
        ListenOptions::default(),
    )
    .unwrap();
    rx
}

async fn next_event(
    rx: &mut mpsc::UnboundedReceiver<(String, Value)>,
) -> (String, Value) {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("presence event should arrive")
        .unwrap()
}

#[tokio::test]
async fn join_propagates_and_the_courtesy_heartbeat_introduces_us_back() {
    init_tracing();
    let (a, b) = linked_pair("a", "b").await;
    let mut a_events = presence_events(&a);
    let mut b_events = presence_events(&b);

    a.start_presence().unwrap();

    // b learns about a from the join broadcast.
    let (name, data) = next_event(&mut b_events).await;
    assert_eq!(name, "presence:join");
    assert_eq!(data["peerId"], json!("a"));

    // a learns about b from b's courtesy heartbeat reply.
    let (name, data) = next_event(&mut a_events).await;
    assert_eq!(name, "presence:join");
    assert_eq!(data["peerId"], json!("b"));
}

#[tokio::test]
async fn explicit_leave_fires_after_join() {
    let (_a, b) = linked_pair("a", "b").await;
    let mut b_events = presence_events(&b);

    let join = json!({
        "mb": 1, "version": 1, "id": "p-1", "type": "prs", "timestamp": 1,
        "payload": {"pt": "join", "peerId": "wanderer", "status": "online", "meta": {}, "ts": 1}
    });
    b.handle_message(join, "local", Some("wanderer"), None)
        .await
        .unwrap();
    let (name, _) = next_event(&mut b_events).await;
    assert_eq!(name, "presence:join");

    let leave = json!({
        "mb": 1, "version": 1, "id": "p-2", "type": "prs", "timestamp": 2,
        "payload": {"pt": "leave", "peerId": "wanderer", "status": "offline", "meta": {}, "ts": 2}
    });
    b.handle_message(leave, "local", Some("wanderer"), None)
        .await
        .unwrap();
    let (name, data) = next_event(&mut b_events).await;
    assert_eq!(name, "presence:leave");
    assert_eq!(data["peerId"], json!("wanderer"));
}

#[tokio::test]
async fn repeated_heartbeats_become_updates() {
    let (_a, b) = linked_pair("a", "b").await;
    let mut b_events = presence_events(&b);

    for (id, ts) in [("h-1", 1), ("h-2", 2)] {
        let hb = json!({
            "mb": 1, "version": 1, "id": id, "type": "prs", "timestamp": ts,
            "payload": {"pt": "heartbeat", "peerId": "steady", "status": "online", "meta": {}, "ts": ts}
        });
        b.handle_message(hb, "local", Some("steady"), None)
            .await
            .unwrap();
    }
    assert_eq!(next_event(&mut b_events).await.0, "presence:join");
    assert_eq!(next_event(&mut b_events).await.0, "presence:update");
}

fn causal_signal(id: &str, name: &str, data: Value, sender: &str, counter: u64) -> Value {
    let mut counters = serde_json::Map::new();
    counters.insert(sender.to_owned(), json!(counter));
    json!({
        "mb": 1, "version": 1, "id": id, "type": "sig", "timestamp": counter,
        "payload": {"name": name, "data": data, "source": {"peerId": sender}},
        "meta": {"vc": {"owner": sender, "counters": counters}}
    })
}

#[tokio::test]
async fn out_of_order_causal_signals_are_delivered_in_causal_order() {
    let c = MessageBus::new(BusOptions {
        peer_id: Some("c".to_owned()),
        causal_ordering: true,
        ..Default::default()
    })
    .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalEvent>();
    c.on(
        "doc:edit",
        Handler::sync(move |ev| {
            let _ = tx.send(ev.clone());
        }),
        ListenOptions::default(),
    )
    .unwrap();

    // m2 (a's second message) arrives before m1.
    let m1 = causal_signal("m1", "doc:edit", json!("first"), "a", 1);
    let m2 = causal_signal("m2", "doc:edit", json!("second"), "a", 2);
    c.handle_message(m2, "local", Some("a"), None).await.unwrap();

    // Nothing may be delivered while the predecessor is missing.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(c.diagnose().causal_buffered, 1);

    c.handle_message(m1, "local", Some("a"), None).await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.data, json!("first"));
    assert_eq!(second.data, json!("second"));
    assert_eq!(c.diagnose().causal_buffered, 0);
}

#[tokio::test]
async fn non_causal_buses_ignore_clock_metadata() {
    let plain = MessageBus::new(BusOptions {
        peer_id: Some("p".to_owned()),
        ..Default::default()
    })
    .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    plain
        .on(
            "doc:edit",
            Handler::sync(move |ev| {
                let _ = tx.send(ev.data.clone());
            }),
            ListenOptions::default(),
        )
        .unwrap();

    // Out of order, but without an orderer both deliver immediately.
    let m2 = causal_signal("m2", "doc:edit", json!("second"), "a", 2);
    let m1 = causal_signal("m1", "doc:edit", json!("first"), "a", 1);
    plain.handle_message(m2, "local", Some("a"), None).await.unwrap();
    plain.handle_message(m1, "local", Some("a"), None).await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), json!("second"));
    assert_eq!(rx.recv().await.unwrap(), json!("first"));
}
