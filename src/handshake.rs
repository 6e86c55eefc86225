//! Three-way handshake: `hsk_init` → `hsk_ack` → `hsk_done`.
//!
//! The initiator sends an init carrying its identity, metadata, capability
//! list and a random challenge, then waits for an ack.  The responder may
//! consult a caller-supplied validator before accepting; a rejecting ack
//! carries the reason.  The initiator confirms with a done message and both
//! sides produce the remote's [`PeerInfo`] with the connection timestamp
//! set at completion, not earlier.

use crate::error::{BusError, BusResult, ErrorKind};
use crate::router::SendFn;
use crate::util::{bounded, deferred, now_ms};
use mb_protocol::{Envelope, HandshakeAck, HandshakeDone, HandshakeInit, MessageKind};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Remote peer identity produced by a completed handshake.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: String,
    pub origin: String,
    pub meta: Map<String, Value>,
    pub capabilities: Vec<String>,
    pub connected_at: i64,
}

/// Inspects an inbound init (plus its stated origin); `false` rejects.
pub type HandshakeValidator = Arc<dyn Fn(&HandshakeInit, &str) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    InitSent,
    AckSent,
}

struct HandshakeRecord {
    phase: Phase,
    /// Initiator-side continuation.
    tx: Option<oneshot::Sender<BusResult<PeerInfo>>>,
    /// Responder-side snapshot of the remote, captured from the init.
    remote: Option<PeerInfo>,
    send: SendFn,
}

/// Identity this engine announces in init/ack messages.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub peer_id: String,
    pub origin: String,
    pub meta: Map<String, Value>,
    pub capabilities: Vec<String>,
}

type PendingMap = Mutex<HashMap<String, HandshakeRecord>>;

pub struct HandshakeEngine {
    local: LocalIdentity,
    pending: Arc<PendingMap>,
    validator: Mutex<Option<HandshakeValidator>>,
    timeout: Duration,
}

impl HandshakeEngine {
    pub fn new(local: LocalIdentity, timeout: Duration) -> Self {
        HandshakeEngine {
            local,
            pending: Arc::new(Mutex::new(HashMap::new())),
            validator: Mutex::new(None),
            timeout,
        }
    }

    /// Install the responder-side validator.
    pub fn set_validator(&self, validator: HandshakeValidator) {
        *self.validator.lock().expect("handshake lock") = Some(validator);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("handshake lock").len()
    }

    /// Initiate a handshake over `send` and wait for completion.
    ///
    /// Resolves with the remote's [`PeerInfo`] once the ack arrives and the
    /// done message has been pushed; rejects with `handshake-timeout` or
    /// `handshake-rejected`.
    pub async fn initiate(&self, send: SendFn) -> BusResult<PeerInfo> {
        let hid = Uuid::new_v4().to_string();
        let (tx, rx) = deferred();
        self.pending.lock().expect("handshake lock").insert(
            hid.clone(),
            HandshakeRecord {
                phase: Phase::InitSent,
                tx: Some(tx),
                remote: None,
                send: send.clone(),
            },
        );

        let init = HandshakeInit {
            hid: hid.clone(),
            peer_id: self.local.peer_id.clone(),
            origin: self.local.origin.clone(),
            challenge: random_challenge(),
            meta: self.local.meta.clone(),
            capabilities: self.local.capabilities.clone(),
            ts: now_ms(),
        };
        let env = Envelope::new(
            MessageKind::HandshakeInit,
            serde_json::to_value(&init).expect("init serializes"),
        );
        if let Err(e) = send(env.to_value()).await {
            self.pending.lock().expect("handshake lock").remove(&hid);
            return Err(e);
        }

        let pending = self.pending.clone();
        let hid_for_timeout = hid.clone();
        bounded(rx, self.timeout, move || {
            pending
                .lock()
                .expect("handshake lock")
                .remove(&hid_for_timeout);
            BusError::new(ErrorKind::HandshakeTimeout).with_details(json!({"hid": hid_for_timeout}))
        })
        .await
    }

    /// Responder side: process an inbound init.
    ///
    /// Sends an accepting or rejecting ack over `reply`.  On accept, a
    /// pending record waits for the done message.
    pub async fn handle_init(&self, init: HandshakeInit, origin: &str, reply: SendFn) {
        let accepted = {
            let validator = self.validator.lock().expect("handshake lock");
            validator.as_ref().is_none_or(|v| v(&init, origin))
        };

        let ack = if accepted {
            HandshakeAck {
                hid: init.hid.clone(),
                peer_id: self.local.peer_id.clone(),
                accept: true,
                response: Some(init.challenge.clone()),
                reason: None,
                meta: self.local.meta.clone(),
                capabilities: self.local.capabilities.clone(),
            }
        } else {
            debug!(hid = init.hid, origin, "handshake init rejected by validator");
            HandshakeAck {
                hid: init.hid.clone(),
                peer_id: self.local.peer_id.clone(),
                accept: false,
                response: None,
                reason: Some("Validation failed".to_owned()),
                meta: Map::new(),
                capabilities: Vec::new(),
            }
        };

        if accepted {
            self.pending.lock().expect("handshake lock").insert(
                init.hid.clone(),
                HandshakeRecord {
                    phase: Phase::AckSent,
                    tx: None,
                    remote: Some(PeerInfo {
                        peer_id: init.peer_id.clone(),
                        origin: origin.to_owned(),
                        meta: init.meta.clone(),
                        capabilities: init.capabilities.clone(),
                        // Provisional; finalized when the done arrives.
                        connected_at: 0,
                    }),
                    send: reply.clone(),
                },
            );
            self.arm_responder_timeout(&init.hid);
        }

        let env = Envelope::new(
            MessageKind::HandshakeAck,
            serde_json::to_value(&ack).expect("ack serializes"),
        );
        if let Err(e) = reply(env.to_value()).await {
            warn!(hid = init.hid, error = %e, "handshake ack send failed");
            self.pending.lock().expect("handshake lock").remove(&init.hid);
        }
    }

    /// Initiator side: process an inbound ack.
    ///
    /// On accept, pushes the done message and resolves the initiate call
    /// with the remote's info; returns that info so the caller can register
    /// the peer.  On reject, the initiate call fails with
    /// `handshake-rejected`.
    pub async fn handle_ack(&self, ack: HandshakeAck, origin: &str) -> Option<PeerInfo> {
        let record = {
            let mut pending = self.pending.lock().expect("handshake lock");
            match pending.get(&ack.hid) {
                Some(r) if r.phase == Phase::InitSent => pending.remove(&ack.hid),
                _ => None,
            }
        };
        let Some(record) = record else {
            warn!(hid = ack.hid, "ack without a matching init-sent handshake");
            return None;
        };

        if !ack.accept {
            let reason = ack.reason.unwrap_or_else(|| "rejected".to_owned());
            if let Some(tx) = record.tx {
                let _ = tx.send(Err(BusError::msg(ErrorKind::HandshakeRejected, reason)
                    .with_details(json!({"hid": ack.hid, "peerId": ack.peer_id}))));
            }
            return None;
        }

        let done = HandshakeDone {
            hid: ack.hid.clone(),
            peer_id: self.local.peer_id.clone(),
            success: true,
        };
        let env = Envelope::new(
            MessageKind::HandshakeDone,
            serde_json::to_value(&done).expect("done serializes"),
        );
        if let Err(e) = (record.send)(env.to_value()).await {
            if let Some(tx) = record.tx {
                let _ = tx.send(Err(e));
            }
            return None;
        }

        let info = PeerInfo {
            peer_id: ack.peer_id,
            origin: origin.to_owned(),
            meta: ack.meta,
            capabilities: ack.capabilities,
            connected_at: now_ms(),
        };
        if let Some(tx) = record.tx {
            let _ = tx.send(Ok(info.clone()));
        }
        Some(info)
    }

    /// Responder side: process the final done message.  Returns the remote
    /// peer info (with the connection timestamp stamped now) on success.
    pub fn handle_done(&self, done: HandshakeDone) -> Option<PeerInfo> {
        let record = {
            let mut pending = self.pending.lock().expect("handshake lock");
            match pending.get(&done.hid) {
                Some(r) if r.phase == Phase::AckSent => pending.remove(&done.hid),
                _ => None,
            }
        };
        let record = record?;
        if !done.success {
            debug!(hid = done.hid, "handshake done reported failure");
            return None;
        }
        record.remote.map(|mut info| {
            info.connected_at = now_ms();
            info
        })
    }

    /// Drop all in-flight handshakes (teardown); initiator-side waits fail
    /// with `destroyed`.
    pub fn clear(&self) {
        let records: Vec<HandshakeRecord> = {
            let mut pending = self.pending.lock().expect("handshake lock");
            pending.drain().map(|(_, r)| r).collect()
        };
        for record in records {
            if let Some(tx) = record.tx {
                let _ = tx.send(Err(BusError::new(ErrorKind::Destroyed)));
            }
        }
    }

    fn arm_responder_timeout(&self, hid: &str) {
        let weak: Weak<PendingMap> = Arc::downgrade(&self.pending);
        let hid = hid.to_owned();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(pending) = weak.upgrade() {
                if pending.lock().expect("handshake lock").remove(&hid).is_some() {
                    debug!(hid, "responder-side handshake timed out waiting for done");
                }
            }
        });
    }
}

fn random_challenge() -> String {
    format!("{:016x}{:016x}", rand::random::<u64>(), rand::random::<u64>())
}
