//! Three-way handshake between two buses, driven over direct links.

use mb_test_utils::{bidirectional_link, init_tracing};
use mesh_bus::{BusOptions, ErrorKind, HandlerOptions, MessageBus, RequestOptions};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn bus(id: &str) -> MessageBus {
    MessageBus::new(BusOptions {
        peer_id: Some(id.to_owned()),
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn successful_handshake_registers_peers_on_both_sides() {
    init_tracing();
    let a = bus("agent");
    let b = bus("hub");
    let (a_to_b, _b_to_a) = bidirectional_link(&a, &b);

    let info = a.handshake(a_to_b).await.unwrap();
    assert_eq!(info.peer_id, "hub");
    assert!(info.connected_at > 0);

    assert!(a.get_peer("hub").is_some());
    assert!(b.get_peer("agent").is_some());

    // The negotiated link carries requests.
    b.handle("echo", |d, _| async move { Ok(d) }, HandlerOptions::default())
        .unwrap();
    let got = a
        .request("hub", "echo", json!({"v": 2}), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(got, json!({"v": 2}));
}

#[tokio::test]
async fn rejected_handshake_fails_with_reason_and_registers_nothing() {
    let a = bus("agent");
    let b = bus("hub");
    b.set_handshake_validator(Arc::new(|_init, _origin| false));
    let (a_to_b, _b_to_a) = bidirectional_link(&a, &b);

    let err = a.handshake(a_to_b).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::HandshakeRejected);
    assert_eq!(err.message, "Validation failed");

    assert!(a.get_peer("hub").is_none());
    assert!(b.get_peer("agent").is_none());
    assert_eq!(a.diagnose().pending_handshakes, 0);
    assert_eq!(b.diagnose().pending_handshakes, 0);
}

#[tokio::test]
async fn validator_sees_init_identity_and_origin() {
    let a = bus("agent");
    let b = bus("hub");
    b.set_handshake_validator(Arc::new(|init, origin| {
        init.peer_id == "agent" && origin == "local" && !init.challenge.is_empty()
    }));
    let (a_to_b, _b_to_a) = bidirectional_link(&a, &b);
    assert!(a.handshake(a_to_b).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn handshake_times_out_when_nobody_answers() {
    let a = MessageBus::new(BusOptions {
        peer_id: Some("agent".to_owned()),
        handshake_timeout: Duration::from_millis(100),
        ..Default::default()
    })
    .unwrap();
    // A send function that swallows everything.
    let void = mesh_bus::send_fn(|_value| async { Ok(()) });
    let err = a.handshake(void).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::HandshakeTimeout);
    assert_eq!(a.diagnose().pending_handshakes, 0);
}
