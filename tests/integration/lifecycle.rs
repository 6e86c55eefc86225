//! Teardown semantics: destroy, peer removal, goodbye propagation.

use mb_test_utils::{init_tracing, linked_pair};
use mesh_bus::{ErrorKind, HandlerOptions, RequestOptions, SignalOptions};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn destroy_rejects_in_flight_requests_with_destroyed() {
    init_tracing();
    let (agent, hub) = linked_pair("agent", "hub").await;
    hub.handle(
        "stall",
        |_d, _c| async move {
            futures_util::future::pending::<()>().await;
            unreachable!()
        },
        HandlerOptions::default(),
    )
    .unwrap();

    let call = {
        let agent = agent.clone();
        tokio::spawn(async move {
            agent
                .request("hub", "stall", json!(null), RequestOptions::default())
                .await
        })
    };
    // Let the request get registered and sent.
    tokio::time::sleep(Duration::from_millis(50)).await;

    agent.destroy().await;
    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Destroyed);
}

#[tokio::test]
async fn remove_peer_rejects_pending_requests_exactly_once() {
    let (agent, _hub) = linked_pair("agent", "hub").await;

    let call = {
        let agent = agent.clone();
        tokio::spawn(async move {
            agent
                .request(
                    "hub",
                    "never-registered",
                    json!(null),
                    RequestOptions {
                        timeout: Some(Duration::from_secs(30)),
                        default_value: None,
                    },
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(agent.diagnose().pending.len(), 1);

    agent.remove_peer("hub").await.unwrap();
    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::PeerDisconnected);
    assert!(agent.diagnose().pending.is_empty());
    assert!(agent.get_peer("hub").is_none());
}

#[tokio::test]
async fn destroy_says_goodbye_so_the_remote_drops_us() {
    let (agent, hub) = linked_pair("agent", "hub").await;
    assert!(hub.get_peer("agent").is_some());

    agent.destroy().await;

    // The goodbye travels through the pump; poll briefly.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while hub.get_peer("agent").is_some() {
        assert!(tokio::time::Instant::now() < deadline, "goodbye never landed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn destroyed_bus_refuses_all_messaging() {
    let (agent, _hub) = linked_pair("agent", "hub").await;
    agent.destroy().await;

    assert_eq!(
        agent
            .signal("x", json!(null), SignalOptions::default())
            .await
            .unwrap_err()
            .kind,
        ErrorKind::Destroyed
    );
    assert_eq!(
        agent
            .request("hub", "x", json!(null), RequestOptions::default())
            .await
            .unwrap_err()
            .kind,
        ErrorKind::Destroyed
    );
    assert_eq!(
        agent.open_stream("hub", "x", None).await.unwrap_err().kind,
        ErrorKind::Destroyed
    );
    assert_eq!(agent.start_presence().unwrap_err().kind, ErrorKind::Destroyed);
    assert_eq!(agent.health_check().status, "destroyed");
    assert_eq!(agent.health_check().peers, 0);
    assert_eq!(agent.health_check().listeners, 0);
}

#[tokio::test]
async fn ping_is_answered_with_a_pong_echoing_the_timestamp() {
    let (_agent, hub) = linked_pair("agent", "hub").await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<serde_json::Value>();
    let reply = mesh_bus::send_fn(move |v| {
        let tx = tx.clone();
        async move {
            tx.send(v)
                .map_err(|_| mesh_bus::BusError::new(ErrorKind::ChannelClosed))
        }
    });

    let ping = json!({
        "mb": 1, "version": 1, "id": "png-1", "type": "png", "timestamp": 5,
        "payload": {"ts": 12_345}
    });
    hub.handle_message(ping, "local", Some("agent"), Some(reply))
        .await
        .unwrap();

    let pong = rx.recv().await.unwrap();
    assert_eq!(pong["type"], json!("pog"));
    assert_eq!(pong["payload"]["ts"], json!(12_345));
}

#[tokio::test]
async fn goodbye_message_cancels_requests_to_the_departed_peer() {
    let (agent, _hub) = linked_pair("agent", "hub").await;

    let call = {
        let agent = agent.clone();
        tokio::spawn(async move {
            agent
                .request(
                    "hub",
                    "slow",
                    json!(null),
                    RequestOptions {
                        timeout: Some(Duration::from_secs(30)),
                        default_value: None,
                    },
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let bye = json!({
        "mb": 1, "version": 1, "id": "bye-1", "type": "bye", "timestamp": 1,
        "payload": {"peerId": "hub"}
    });
    agent
        .handle_message(bye, "local", Some("hub"), None)
        .await
        .unwrap();

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::PeerDisconnected);
}
