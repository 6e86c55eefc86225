//! Peer routing.
//!
//! The router exclusively owns the peer registry.  Each entry holds the
//! peer's declared origin and kind, a send function the router invokes to
//! push a message toward the peer, and per-peer delivery state (sequence
//! counter, optional offline queue).  Unicast and broadcast both construct
//! the short per-peer envelope unless the payload is already a wrapped
//! protocol envelope, in which case it travels as-is.

use crate::emitter::EventEmitter;
use crate::error::{BusError, BusResult, ErrorKind};
use crate::util::now_ms;
use futures_util::future::BoxFuture;
use mb_protocol::{Envelope, MessageKind, ShortEnvelope, SourceRef};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Peer model
// ---------------------------------------------------------------------------

/// How a peer is reached.  `send` pushes one wire value toward the peer.
pub type SendFn = Arc<dyn Fn(Value) -> BoxFuture<'static, BusResult<()>> + Send + Sync>;

/// Wrap an async closure as a [`SendFn`].
pub fn send_fn<F, Fut>(f: F) -> SendFn
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BusResult<()>> + Send + 'static,
{
    Arc::new(move |value| Box::pin(f(value)))
}

/// Declared peer kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerKind {
    Frame,
    Worker,
    ServiceWorker,
    Window,
    Port,
    #[default]
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Failed,
}

/// Registration options for a peer.
#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    pub origin: String,
    pub kind: PeerKind,
    pub meta: Map<String, Value>,
    pub capabilities: Vec<String>,
    /// Offline queue capacity; `None` disables queueing for this peer.
    pub offline_queue: Option<usize>,
}

struct PeerEntry {
    id: String,
    origin: String,
    kind: PeerKind,
    send: SendFn,
    meta: Map<String, Value>,
    capabilities: Vec<String>,
    status: PeerStatus,
    connected_at: i64,
    last_seen: i64,
    seq: u64,
    queue: Option<VecDeque<Value>>,
    queue_cap: usize,
}

/// Public, send-function-free view of a peer entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSnapshot {
    pub id: String,
    pub origin: String,
    pub kind: PeerKind,
    pub status: PeerStatus,
    pub connected_at: i64,
    pub last_seen: i64,
    pub capabilities: Vec<String>,
    pub meta: Map<String, Value>,
    pub queued: usize,
}

impl PeerEntry {
    fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            id: self.id.clone(),
            origin: self.origin.clone(),
            kind: self.kind,
            status: self.status,
            connected_at: self.connected_at,
            last_seen: self.last_seen,
            capabilities: self.capabilities.clone(),
            meta: self.meta.clone(),
            queued: self.queue.as_ref().map_or(0, VecDeque::len),
        }
    }
}

// ---------------------------------------------------------------------------
// Routing outcomes
// ---------------------------------------------------------------------------

/// Aggregate result of a unicast or broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct RouteOutcome {
    pub success: bool,
    pub delivered: usize,
    pub failed: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BusError>,
}

impl RouteOutcome {
    fn failure(peer: &str, error: BusError) -> Self {
        RouteOutcome {
            success: false,
            delivered: 0,
            failed: vec![peer.to_owned()],
            error: Some(error),
        }
    }
}

/// Broadcast filters.
#[derive(Debug, Clone, Default)]
pub struct BroadcastOptions {
    pub exclude: Vec<String>,
    /// When set, only these peers are considered.
    pub include: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct Router {
    peers: Mutex<HashMap<String, PeerEntry>>,
    emitter: EventEmitter,
    self_id: String,
    max_peers: usize,
}

impl Router {
    pub fn new(emitter: EventEmitter, self_id: impl Into<String>, max_peers: usize) -> Self {
        Router {
            peers: Mutex::new(HashMap::new()),
            emitter,
            self_id: self_id.into(),
            max_peers,
        }
    }

    /// Register a peer.  Duplicate identifiers fail with `peer-exists`.
    pub async fn add_peer(&self, id: &str, send: SendFn, cfg: PeerConfig) -> BusResult<()> {
        {
            let mut peers = self.peers.lock().expect("router lock");
            if peers.contains_key(id) {
                return Err(
                    BusError::new(ErrorKind::PeerExists).with_details(json!({"peerId": id}))
                );
            }
            if peers.len() >= self.max_peers {
                return Err(BusError::new(ErrorKind::MaxPeers)
                    .with_details(json!({"maxPeers": self.max_peers})));
            }
            let now = now_ms();
            let queue_cap = cfg.offline_queue.unwrap_or(0);
            peers.insert(
                id.to_owned(),
                PeerEntry {
                    id: id.to_owned(),
                    origin: cfg.origin,
                    kind: cfg.kind,
                    send,
                    meta: cfg.meta,
                    capabilities: cfg.capabilities,
                    status: PeerStatus::Connected,
                    connected_at: now,
                    last_seen: now,
                    seq: 0,
                    queue: cfg.offline_queue.map(|_| VecDeque::new()),
                    queue_cap,
                },
            );
        }
        debug!(peer_id = id, "peer added");
        self.emitter
            .emit("peer:added", json!({"peerId": id}), SourceRef::new(&self.self_id))
            .await;
        Ok(())
    }

    /// Unregister a peer and release its per-peer state.
    pub async fn remove_peer(&self, id: &str) -> BusResult<PeerSnapshot> {
        let entry = self.peers.lock().expect("router lock").remove(id);
        let Some(entry) = entry else {
            return Err(BusError::new(ErrorKind::PeerNotFound).with_details(json!({"peerId": id})));
        };
        let snapshot = entry.snapshot();
        debug!(peer_id = id, "peer removed");
        self.emitter
            .emit("peer:removed", json!({"peerId": id}), SourceRef::new(&self.self_id))
            .await;
        Ok(snapshot)
    }

    pub fn get(&self, id: &str) -> Option<PeerSnapshot> {
        self.peers
            .lock()
            .expect("router lock")
            .get(id)
            .map(PeerEntry::snapshot)
    }

    pub fn has(&self, id: &str) -> bool {
        self.peers.lock().expect("router lock").contains_key(id)
    }

    pub fn list(&self) -> Vec<PeerSnapshot> {
        self.peers
            .lock()
            .expect("router lock")
            .values()
            .map(PeerEntry::snapshot)
            .collect()
    }

    pub fn connected_ids(&self) -> Vec<String> {
        self.peers
            .lock()
            .expect("router lock")
            .values()
            .filter(|p| p.status == PeerStatus::Connected)
            .map(|p| p.id.clone())
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().expect("router lock").len()
    }

    /// Refresh a peer's last-seen time (heartbeats, presence).
    pub fn touch(&self, id: &str) {
        if let Some(entry) = self.peers.lock().expect("router lock").get_mut(id) {
            entry.last_seen = now_ms();
        }
    }

    /// Update a peer's status.  A transition into `Connected` drains the
    /// peer's offline queue in FIFO order.
    pub async fn set_status(&self, id: &str, status: PeerStatus) {
        let drained: Vec<Value> = {
            let mut peers = self.peers.lock().expect("router lock");
            let Some(entry) = peers.get_mut(id) else { return };
            let was = entry.status;
            entry.status = status;
            if status != PeerStatus::Connected {
                return;
            }
            entry.connected_at = now_ms();
            if was == PeerStatus::Connected {
                return;
            }
            match entry.queue.as_mut() {
                Some(queue) => queue.drain(..).collect(),
                None => return,
            }
        };
        let send = {
            let peers = self.peers.lock().expect("router lock");
            match peers.get(id) {
                Some(entry) => entry.send.clone(),
                None => return,
            }
        };
        for value in drained {
            if let Err(e) = send(value).await {
                warn!(peer_id = id, error = %e, "offline queue flush send failed");
            }
        }
    }

    /// Unicast `payload` (of `kind`) to `target`.
    ///
    /// An already-wrapped envelope is sent untouched; anything else is
    /// wrapped in the short per-peer envelope with the next sequence.
    pub async fn route(&self, target: &str, kind: MessageKind, payload: Value) -> RouteOutcome {
        let prepared = {
            let mut peers = self.peers.lock().expect("router lock");
            let Some(entry) = peers.get_mut(target) else {
                return RouteOutcome::failure(
                    target,
                    BusError::new(ErrorKind::PeerNotFound)
                        .with_details(json!({"peerId": target})),
                );
            };
            let wire = wrap_for_peer(entry, kind, payload);
            if entry.status != PeerStatus::Connected {
                return match entry.queue.as_mut() {
                    Some(queue) => {
                        if queue.len() >= entry.queue_cap {
                            RouteOutcome::failure(
                                target,
                                BusError::new(ErrorKind::QueueFull)
                                    .with_details(json!({"peerId": target, "capacity": entry.queue_cap})),
                            )
                        } else {
                            queue.push_back(wire);
                            RouteOutcome {
                                success: true,
                                delivered: 0,
                                failed: Vec::new(),
                                error: None,
                            }
                        }
                    }
                    None => RouteOutcome::failure(
                        target,
                        BusError::new(ErrorKind::PeerDisconnected)
                            .with_details(json!({"peerId": target})),
                    ),
                };
            }
            (entry.send.clone(), wire)
        };

        let (send, wire) = prepared;
        match send(wire).await {
            Ok(()) => RouteOutcome {
                success: true,
                delivered: 1,
                failed: Vec::new(),
                error: None,
            },
            Err(e) => {
                warn!(peer_id = target, error = %e, "unicast send failed");
                RouteOutcome::failure(
                    target,
                    BusError::msg(ErrorKind::SendFailed, e.message)
                        .with_details(json!({"peerId": target})),
                )
            }
        }
    }

    /// Broadcast `payload` to every connected peer passing the filters.
    /// Per-peer envelopes are constructed with each peer's own sequence.
    /// No retries happen at this layer.
    pub async fn broadcast(
        &self,
        kind: MessageKind,
        payload: Value,
        opts: &BroadcastOptions,
    ) -> RouteOutcome {
        let targets: Vec<(String, SendFn, Value)> = {
            let mut peers = self.peers.lock().expect("router lock");
            let ids: Vec<String> = peers
                .values()
                .filter(|p| p.status == PeerStatus::Connected)
                .filter(|p| !opts.exclude.contains(&p.id))
                .filter(|p| {
                    opts.include
                        .as_ref()
                        .is_none_or(|inc| inc.contains(&p.id))
                })
                .map(|p| p.id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    peers.get_mut(&id).map(|entry| {
                        let wire = wrap_for_peer(entry, kind, payload.clone());
                        (id, entry.send.clone(), wire)
                    })
                })
                .collect()
        };

        let mut delivered = 0usize;
        let mut failed = Vec::new();
        for (id, send, wire) in targets {
            match send(wire).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(peer_id = id, error = %e, "broadcast send failed");
                    failed.push(id);
                }
            }
        }
        RouteOutcome {
            success: failed.is_empty(),
            delivered,
            failed,
            error: None,
        }
    }

    /// Drop every peer (bus teardown).  No signals are emitted.
    pub fn clear(&self) {
        self.peers.lock().expect("router lock").clear();
    }
}

/// Build the wire value for one peer: pass wrapped envelopes through,
/// wrap bare payloads in the short envelope with the next sequence.
fn wrap_for_peer(entry: &mut PeerEntry, kind: MessageKind, payload: Value) -> Value {
    if Envelope::is_wrapped(&payload) {
        return payload;
    }
    entry.seq += 1;
    serde_json::to_value(ShortEnvelope {
        id: Uuid::new_v4().to_string(),
        t: kind,
        ts: now_ms(),
        seq: entry.seq,
        p: payload,
    })
    .expect("short envelope serialization is infallible")
}
