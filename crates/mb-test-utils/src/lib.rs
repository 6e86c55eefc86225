//! Test helpers: in-memory transports and pre-wired bus pairs.
//!
//! `memory_pair` builds two crossed channel-backed transports; `linked_pair`
//! goes one step further and returns two buses already wired to each other
//! with known peer ids, which is what most integration suites want.

pub mod memory;

use mesh_bus::{BusOptions, MessageBus, SendFn, TransportOptions, send_fn};
use std::sync::{Arc, OnceLock};

pub use memory::{MemoryTransport, memory_pair};

/// Install a fmt subscriber honoring `RUST_LOG`.  Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Two buses with the given ids, wired to each other over in-memory
/// transports, both on the default `local` origin.
pub async fn linked_pair(a_id: &str, b_id: &str) -> (MessageBus, MessageBus) {
    linked_pair_with(a_id, b_id, BusOptions::default(), BusOptions::default()).await
}

/// As [`linked_pair`] but with explicit options per side.
pub async fn linked_pair_with(
    a_id: &str,
    b_id: &str,
    mut a_opts: BusOptions,
    mut b_opts: BusOptions,
) -> (MessageBus, MessageBus) {
    a_opts.peer_id = Some(a_id.to_owned());
    b_opts.peer_id = Some(b_id.to_owned());
    let a = MessageBus::new(a_opts).expect("bus a");
    let b = MessageBus::new(b_opts).expect("bus b");
    link(&a, &b).await;
    (a, b)
}

/// Wire two existing buses together over an in-memory transport pair.
pub async fn link(a: &MessageBus, b: &MessageBus) {
    let (ta, tb) = memory_pair(a.peer_id(), "local", b.peer_id(), "local");
    a.add_transport(
        ta,
        TransportOptions {
            peer_id: Some(b.peer_id().to_owned()),
            origin: Some("local".to_owned()),
            offline_queue: None,
        },
    )
    .await
    .expect("wire a");
    b.add_transport(
        tb,
        TransportOptions {
            peer_id: Some(a.peer_id().to_owned()),
            origin: Some("local".to_owned()),
            offline_queue: None,
        },
    )
    .await
    .expect("wire b");
}

/// Direct send functions between two buses without transports: each side's
/// sends land in the other's `handle_message`, with replies flowing back.
///
/// Useful where the caller drives the protocol by hand (handshake tests).
pub fn bidirectional_link(a: &MessageBus, b: &MessageBus) -> (SendFn, SendFn) {
    let a_to_b_slot: Arc<OnceLock<SendFn>> = Arc::new(OnceLock::new());
    let b_to_a_slot: Arc<OnceLock<SendFn>> = Arc::new(OnceLock::new());

    let a_to_b: SendFn = {
        let b = b.clone();
        let from = a.peer_id().to_owned();
        let reply_slot = b_to_a_slot.clone();
        send_fn(move |value| {
            let b = b.clone();
            let from = from.clone();
            let reply = reply_slot.get().cloned();
            async move { b.handle_message(value, "local", Some(&from), reply).await }
        })
    };
    let b_to_a: SendFn = {
        let a = a.clone();
        let from = b.peer_id().to_owned();
        let reply_slot = a_to_b_slot.clone();
        send_fn(move |value| {
            let a = a.clone();
            let from = from.clone();
            let reply = reply_slot.get().cloned();
            async move { a.handle_message(value, "local", Some(&from), reply).await }
        })
    };

    let _ = a_to_b_slot.set(a_to_b.clone());
    let _ = b_to_a_slot.set(b_to_a.clone());
    (a_to_b, b_to_a)
}
