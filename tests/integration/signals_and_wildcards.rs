//! Local wildcard dispatch and remote signal delivery, including the
//! short-envelope wire shape.

use mb_test_utils::{init_tracing, link, linked_pair};
use mesh_bus::{
    BusOptions, Handler, ListenOptions, MessageBus, SignalEvent, SignalOptions,
};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test]
async fn wildcard_listeners_fire_in_priority_order_with_full_events() {
    init_tracing();
    let bus = MessageBus::new(BusOptions {
        peer_id: Some("self".to_owned()),
        ..Default::default()
    })
    .unwrap();

    let log: Arc<Mutex<Vec<(String, SignalEvent)>>> = Arc::default();
    let listener = |tag: &str, log: &Arc<Mutex<Vec<(String, SignalEvent)>>>| {
        let log = log.clone();
        let tag = tag.to_owned();
        Handler::sync(move |ev| log.lock().unwrap().push((tag.clone(), ev.clone())))
    };

    bus.on(
        "user:*",
        listener("h1", &log),
        ListenOptions {
            priority: 5,
            ..Default::default()
        },
    )
    .unwrap();
    bus.on(
        "*",
        listener("h2", &log),
        ListenOptions {
            priority: 1,
            ..Default::default()
        },
    )
    .unwrap();
    bus.on(
        "user:login",
        listener("h3", &log),
        ListenOptions {
            priority: 10,
            ..Default::default()
        },
    )
    .unwrap();

    let count = bus.emit("user:login", json!({"uid": 7})).await.unwrap();
    assert_eq!(count, 3);

    let log = log.lock().unwrap();
    let order: Vec<&str> = log.iter().map(|(tag, _)| tag.as_str()).collect();
    assert_eq!(order, vec!["h3", "h1", "h2"]);
    for (_, ev) in log.iter() {
        assert_eq!(ev.name, "user:login");
        assert_eq!(ev.data, json!({"uid": 7}));
        assert_eq!(ev.source.peer_id, "self");
    }
}

#[tokio::test]
async fn remote_signal_reaches_namespace_listeners() {
    let (a, b) = linked_pair("a", "b").await;
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalEvent>();
    b.on(
        "alert:*",
        Handler::sync(move |ev| {
            let _ = tx.send(ev.clone());
        }),
        ListenOptions::default(),
    )
    .unwrap();

    let outcome = a
        .signal("alert:fire", json!({"severity": 3}), SignalOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.delivered, 1);
    assert!(outcome.failed.is_empty());

    let ev = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("signal should arrive")
        .unwrap();
    assert_eq!(ev.name, "alert:fire");
    assert_eq!(ev.data, json!({"severity": 3}));
    assert_eq!(ev.source.peer_id, "a");
}

#[tokio::test]
async fn signal_exclude_filters_targets() {
    let a = MessageBus::new(BusOptions {
        peer_id: Some("a".to_owned()),
        ..Default::default()
    })
    .unwrap();
    let b = MessageBus::new(BusOptions {
        peer_id: Some("b".to_owned()),
        ..Default::default()
    })
    .unwrap();
    let c = MessageBus::new(BusOptions {
        peer_id: Some("c".to_owned()),
        ..Default::default()
    })
    .unwrap();
    link(&a, &b).await;
    link(&a, &c).await;

    let hits = |bus: &MessageBus| {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        bus.on(
            "tick",
            Handler::sync(move |ev| {
                let _ = tx.send(ev.name.clone());
            }),
            ListenOptions::default(),
        )
        .unwrap();
        rx
    };
    let mut b_rx = hits(&b);
    let mut c_rx = hits(&c);

    let outcome = a
        .signal(
            "tick",
            json!(null),
            SignalOptions {
                exclude: vec!["c".to_owned()],
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.delivered, 1);

    assert!(
        tokio::time::timeout(Duration::from_secs(2), b_rx.recv())
            .await
            .unwrap()
            .is_some()
    );
    // c must stay silent; give the pumps a moment to drain.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(c_rx.try_recv().is_err());
}

#[tokio::test]
async fn both_wire_shapes_are_accepted_inbound() {
    let bus = MessageBus::new(BusOptions {
        peer_id: Some("self".to_owned()),
        ..Default::default()
    })
    .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    bus.on(
        "net:tick",
        Handler::sync(move |ev| {
            let _ = tx.send(ev.data.clone());
        }),
        ListenOptions::default(),
    )
    .unwrap();

    // Short transport wrap.
    let short = json!({
        "id": "m-1",
        "t": "sig",
        "ts": 1,
        "seq": 1,
        "p": {"name": "net:tick", "data": {"n": 1}, "source": {"peerId": "remote"}}
    });
    bus.handle_message(short, "local", Some("remote"), None)
        .await
        .unwrap();

    // Verbose canonical envelope.
    let verbose = json!({
        "mb": 1,
        "version": 1,
        "id": "m-2",
        "type": "sig",
        "timestamp": 2,
        "payload": {"name": "net:tick", "data": {"n": 2}, "source": {"peerId": "remote"}}
    });
    bus.handle_message(verbose, "local", Some("remote"), None)
        .await
        .unwrap();

    assert_eq!(rx.recv().await.unwrap(), json!({"n": 1}));
    assert_eq!(rx.recv().await.unwrap(), json!({"n": 2}));
}

#[tokio::test]
async fn sync_emission_counts_listeners() {
    let bus = MessageBus::new(BusOptions::default()).unwrap();
    let seen: Arc<Mutex<Vec<Value>>> = Arc::default();
    for _ in 0..2 {
        let seen = seen.clone();
        bus.on(
            "hot:path",
            Handler::sync(move |ev| seen.lock().unwrap().push(ev.data.clone())),
            ListenOptions::default(),
        )
        .unwrap();
    }
    assert_eq!(bus.emit_sync("hot:path", json!(1)).unwrap(), 2);
    assert_eq!(bus.emit_sync("hot:path", json!(2)).unwrap(), 2);
    assert_eq!(bus.emit_sync("cold", json!(1)).unwrap(), 0);
    assert_eq!(seen.lock().unwrap().len(), 4);
}
