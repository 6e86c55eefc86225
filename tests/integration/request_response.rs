//! Request/response over linked buses: correlation, timeouts, handler
//! security and hook round-trips.

use mesh_bus::{
    BusOptions, ErrorKind, HandlerOptions, MessageBus, RequestOptions, hook,
};
use mb_test_utils::{init_tracing, link, linked_pair};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn echo_round_trip_resolves_and_leaves_no_pending_entry() {
    init_tracing();
    let (agent, hub) = linked_pair("agent", "hub").await;
    hub.handle("echo", |data, _ctx| async move { Ok(data) }, HandlerOptions::default())
        .unwrap();

    let got = agent
        .request("hub", "echo", json!({"v": 1}), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(got, json!({"v": 1}));
    assert!(agent.diagnose().pending.is_empty());
    assert!(hub.diagnose().pending.is_empty());
}

#[tokio::test]
async fn handler_sees_request_context() {
    let (agent, hub) = linked_pair("agent", "hub").await;
    hub.handle(
        "whoami",
        |_data, ctx| async move {
            Ok(json!({
                "peer": ctx.peer_id,
                "handler": ctx.handler_name,
                "hasRequestId": !ctx.request_id.is_empty(),
            }))
        },
        HandlerOptions::default(),
    )
    .unwrap();

    let got = agent
        .request("hub", "whoami", json!(null), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(got["peer"], json!("agent"));
    assert_eq!(got["handler"], json!("whoami"));
    assert_eq!(got["hasRequestId"], json!(true));
}

#[tokio::test]
async fn handler_error_is_classified_with_message() {
    let (agent, hub) = linked_pair("agent", "hub").await;
    hub.handle(
        "explode",
        |_d, _c| async move {
            Err(mesh_bus::BusError::msg(ErrorKind::HandlerError, "boom"))
        },
        HandlerOptions::default(),
    )
    .unwrap();

    let err = agent
        .request("hub", "explode", json!(null), RequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::HandlerError);
    assert_eq!(err.message, "boom");
}

#[tokio::test(start_paused = true)]
async fn unhandled_request_times_out_with_default_value() {
    let (agent, _hub) = linked_pair("agent", "hub").await;
    let got = agent
        .request(
            "hub",
            "x",
            json!({}),
            RequestOptions {
                timeout: Some(Duration::from_millis(50)),
                default_value: Some(json!("fallback")),
            },
        )
        .await
        .unwrap();
    assert_eq!(got, json!("fallback"));
    assert!(agent.diagnose().pending.is_empty());
}

#[tokio::test(start_paused = true)]
async fn unhandled_request_times_out_with_details() {
    let (agent, _hub) = linked_pair("agent", "hub").await;
    let err = agent
        .request(
            "hub",
            "x",
            json!({}),
            RequestOptions {
                timeout: Some(Duration::from_millis(50)),
                default_value: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ResponseTimeout);
    let details = err.details.unwrap();
    assert_eq!(details["peerId"], json!("hub"));
    assert_eq!(details["handler"], json!("x"));
}

#[tokio::test]
async fn request_to_unknown_peer_fails_synchronously() {
    let (agent, _hub) = linked_pair("agent", "hub").await;
    let err = agent
        .request("ghost", "x", json!(null), RequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::PeerNotFound);
}

#[tokio::test]
async fn allowed_peers_gate_rejects_unauthorized_caller() {
    let (agent, hub) = linked_pair("agent", "hub").await;
    hub.handle(
        "admin",
        |d, _| async move { Ok(d) },
        HandlerOptions {
            allowed_peers: Some(vec!["operator".to_owned()]),
            ..Default::default()
        },
    )
    .unwrap();

    let err = agent
        .request("hub", "admin", json!(null), RequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Unauthorized);
}

#[tokio::test]
async fn rate_limit_admits_exactly_the_window_budget() {
    let (agent, hub) = linked_pair("agent", "hub").await;
    hub.handle(
        "metered",
        |d, _| async move { Ok(d) },
        HandlerOptions {
            rate_limit: Some(2),
            ..Default::default()
        },
    )
    .unwrap();

    for _ in 0..2 {
        agent
            .request("hub", "metered", json!(1), RequestOptions::default())
            .await
            .unwrap();
    }
    let err = agent
        .request("hub", "metered", json!(1), RequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::RateLimited);
}

#[tokio::test]
async fn payload_validator_rejects_bad_shapes() {
    let (agent, hub) = linked_pair("agent", "hub").await;
    hub.handle(
        "typed",
        |d, _| async move { Ok(d) },
        HandlerOptions {
            validate: Some(Arc::new(|v: &Value| v.get("uid").is_some())),
            ..Default::default()
        },
    )
    .unwrap();

    agent
        .request("hub", "typed", json!({"uid": 7}), RequestOptions::default())
        .await
        .unwrap();
    let err = agent
        .request("hub", "typed", json!({"nope": 1}), RequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidPayload);
}

#[tokio::test]
async fn broadcast_request_maps_peer_outcomes() {
    let caller = MessageBus::new(BusOptions {
        peer_id: Some("caller".to_owned()),
        ..Default::default()
    })
    .unwrap();
    let hub = MessageBus::new(BusOptions {
        peer_id: Some("hub".to_owned()),
        ..Default::default()
    })
    .unwrap();
    let worker = MessageBus::new(BusOptions {
        peer_id: Some("worker".to_owned()),
        ..Default::default()
    })
    .unwrap();
    link(&caller, &hub).await;
    link(&caller, &worker).await;

    hub.handle("stat", |_, _| async move { Ok(json!("hub-ok")) }, HandlerOptions::default())
        .unwrap();
    worker
        .handle(
            "stat",
            |_, _| async move {
                Err(mesh_bus::BusError::msg(ErrorKind::HandlerError, "worker down"))
            },
            HandlerOptions::default(),
        )
        .unwrap();

    let results = caller
        .broadcast_request(
            "stat",
            json!(null),
            mesh_bus::BroadcastRequestOptions {
                ignore_errors: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results["hub"].success);
    assert_eq!(results["hub"].data, Some(json!("hub-ok")));
    assert!(!results["worker"].success);
    assert_eq!(
        results["worker"].error.as_ref().unwrap().kind,
        ErrorKind::HandlerError
    );

    // Without ignore_errors the aggregate rejects.
    let err = caller
        .broadcast_request("stat", json!(null), Default::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::HandlerError);
}

#[tokio::test]
async fn inverse_hook_chains_preserve_the_payload_round_trip() {
    let (agent, hub) = linked_pair("agent", "hub").await;

    // Encode on the way out, decode on the way in — both directions.
    let encode = |v: Value, _| async move { Ok(json!({"wrapped": v})) };
    let decode =
        |v: Value, _| async move { Ok(v.get("wrapped").cloned().unwrap_or(v)) };
    agent.add_outbound_hook(hook(encode), 0);
    agent.add_inbound_hook(hook(decode), 0);
    hub.add_outbound_hook(hook(encode), 0);
    hub.add_inbound_hook(hook(decode), 0);

    hub.handle("echo", |d, _| async move { Ok(d) }, HandlerOptions::default())
        .unwrap();

    let payload = json!({"uid": 7, "tags": ["x", "y"], "nested": {"ok": true}});
    let got = agent
        .request("hub", "echo", payload.clone(), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(got, payload);
}
