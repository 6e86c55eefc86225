//! Presence: heartbeat-based liveness view of known peers.
//!
//! On start the manager broadcasts a `join`, then a `heartbeat` on the
//! configured cadence; the same tick sweeps peers whose last-seen is older
//! than the timeout.  A peer moving from unknown or offline to online emits
//! `presence:join`; explicit leave or stale eviction emits `presence:leave`;
//! a heartbeat or update from a known live peer emits `presence:update`.
//!
//! One asymmetry is deliberate: an inbound `join` gets a courtesy direct
//! heartbeat back so the newcomer learns about us immediately, but inbound
//! `heartbeat` messages are never answered.

use crate::emitter::EventEmitter;
use crate::util::now_ms;
use futures_util::future::BoxFuture;
use mb_protocol::{PresenceKind, PresencePayload, SourceRef};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Push a presence payload: `None` target broadcasts, `Some(peer)` sends
/// directly to that peer.  Supplied by the facade; failures are its concern.
pub type PresenceSendFn =
    Arc<dyn Fn(Option<String>, PresencePayload) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub heartbeat_interval: Duration,
    /// Peers silent for longer than this are evicted.
    pub timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        PresenceConfig {
            heartbeat_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(90),
        }
    }
}

struct PresenceEntry {
    last_seen: tokio::time::Instant,
    meta: Map<String, Value>,
}

pub struct PresenceManager {
    self_id: String,
    config: PresenceConfig,
    emitter: EventEmitter,
    peers: Mutex<HashMap<String, PresenceEntry>>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl PresenceManager {
    pub fn new(self_id: impl Into<String>, config: PresenceConfig, emitter: EventEmitter) -> Self {
        PresenceManager {
            self_id: self_id.into(),
            config,
            emitter,
            peers: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Broadcast a join, then run the heartbeat/sweep loop until `stop`.
    pub fn start(self: Arc<Self>, send: PresenceSendFn) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(peer_id = self.self_id, "presence started");
        let manager = self;
        tokio::spawn(async move {
            send(None, manager.own_payload(PresenceKind::Join)).await;
            let mut ticker = tokio::time::interval(manager.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so the join is not
            // chased by an instant heartbeat.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        send(None, manager.own_payload(PresenceKind::Heartbeat)).await;
                        manager.sweep().await;
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Process an inbound presence message.  Our own messages are ignored.
    pub async fn handle(&self, payload: PresencePayload, send: &PresenceSendFn) {
        if payload.peer_id == self.self_id {
            return;
        }
        match payload.pt {
            PresenceKind::Join => {
                let newly_online = self.upsert(&payload);
                if newly_online {
                    self.emit("presence:join", &payload).await;
                }
                // Courtesy heartbeat so the newcomer sees us without waiting
                // a full interval.  Only for join; never for heartbeat.
                send(
                    Some(payload.peer_id.clone()),
                    self.own_payload(PresenceKind::Heartbeat),
                )
                .await;
            }
            PresenceKind::Leave => {
                let known = self
                    .peers
                    .lock()
                    .expect("presence lock")
                    .remove(&payload.peer_id)
                    .is_some();
                if known {
                    self.emit("presence:leave", &payload).await;
                }
            }
            PresenceKind::Heartbeat | PresenceKind::Update => {
                let newly_online = self.upsert(&payload);
                if newly_online {
                    self.emit("presence:join", &payload).await;
                } else {
                    self.emit("presence:update", &payload).await;
                }
            }
        }
    }

    /// Peers currently considered online.
    pub fn online_peers(&self) -> Vec<String> {
        self.peers
            .lock()
            .expect("presence lock")
            .keys()
            .cloned()
            .collect()
    }

    pub fn online_count(&self) -> usize {
        self.peers.lock().expect("presence lock").len()
    }

    /// Returns true when the peer was unknown (or evicted) before.
    fn upsert(&self, payload: &PresencePayload) -> bool {
        let mut peers = self.peers.lock().expect("presence lock");
        let newly = !peers.contains_key(&payload.peer_id);
        peers.insert(
            payload.peer_id.clone(),
            PresenceEntry {
                last_seen: tokio::time::Instant::now(),
                meta: payload.meta.clone(),
            },
        );
        newly
    }

    /// Evict peers whose last-seen is older than the timeout.
    async fn sweep(&self) {
        let timeout = self.config.timeout;
        let evicted: Vec<(String, Map<String, Value>)> = {
            let mut peers = self.peers.lock().expect("presence lock");
            let stale: Vec<String> = peers
                .iter()
                .filter(|(_, e)| e.last_seen.elapsed() > timeout)
                .map(|(id, _)| id.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|id| peers.remove(&id).map(|e| (id, e.meta)))
                .collect()
        };
        for (peer_id, meta) in evicted {
            debug!(peer_id, "presence peer evicted as stale");
            let payload = PresencePayload {
                pt: PresenceKind::Leave,
                peer_id,
                status: Some("offline".to_owned()),
                meta,
                ts: now_ms(),
            };
            self.emit("presence:leave", &payload).await;
        }
    }

    async fn emit(&self, name: &str, payload: &PresencePayload) {
        self.emitter
            .emit(
                name,
                json!({
                    "peerId": payload.peer_id,
                    "status": payload.status,
                    "meta": payload.meta,
                    "ts": payload.ts,
                }),
                SourceRef::new(&self.self_id),
            )
            .await;
    }

    fn own_payload(&self, pt: PresenceKind) -> PresencePayload {
        PresencePayload {
            pt,
            peer_id: self.self_id.clone(),
            status: Some("online".to_owned()),
            meta: Map::new(),
            ts: now_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn collector() -> (
        PresenceSendFn,
        mpsc::UnboundedReceiver<(Option<String>, PresencePayload)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let send: PresenceSendFn = Arc::new(move |target, payload| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send((target, payload));
            })
        });
        (send, rx)
    }

    fn events(emitter: &EventEmitter) -> Arc<Mutex<Vec<String>>> {
        let log: Arc<Mutex<Vec<String>>> = Arc::default();
        let h = {
            let log = log.clone();
            crate::emitter::Handler::sync(move |ev| log.lock().unwrap().push(ev.name.clone()))
        };
        emitter
            .on("presence:*", h, crate::emitter::ListenOptions::default())
            .unwrap();
        log
    }

    fn payload(pt: PresenceKind, peer: &str) -> PresencePayload {
        PresencePayload {
            pt,
            peer_id: peer.to_owned(),
            status: Some("online".to_owned()),
            meta: Map::new(),
            ts: now_ms(),
        }
    }

    #[tokio::test]
    async fn join_emits_event_and_sends_courtesy_heartbeat() {
        let emitter = EventEmitter::new(64);
        let log = events(&emitter);
        let manager = PresenceManager::new("self", PresenceConfig::default(), emitter);
        let (send, mut rx) = collector();

        manager.handle(payload(PresenceKind::Join, "peer-a"), &send).await;
        assert_eq!(*log.lock().unwrap(), vec!["presence:join".to_owned()]);

        let (target, hb) = rx.try_recv().unwrap();
        assert_eq!(target.as_deref(), Some("peer-a"));
        assert_eq!(hb.pt, PresenceKind::Heartbeat);
        assert_eq!(hb.peer_id, "self");
    }

    #[tokio::test]
    async fn heartbeat_from_unknown_peer_joins_without_courtesy_reply() {
        let emitter = EventEmitter::new(64);
        let log = events(&emitter);
        let manager = PresenceManager::new("self", PresenceConfig::default(), emitter);
        let (send, mut rx) = collector();

        manager
            .handle(payload(PresenceKind::Heartbeat, "peer-a"), &send)
            .await;
        assert_eq!(*log.lock().unwrap(), vec!["presence:join".to_owned()]);
        // The asymmetry: no reply to heartbeats.
        assert!(rx.try_recv().is_err());

        manager
            .handle(payload(PresenceKind::Heartbeat, "peer-a"), &send)
            .await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["presence:join".to_owned(), "presence:update".to_owned()]
        );
    }

    #[tokio::test]
    async fn own_messages_are_ignored() {
        let emitter = EventEmitter::new(64);
        let log = events(&emitter);
        let manager = PresenceManager::new("self", PresenceConfig::default(), emitter);
        let (send, mut rx) = collector();
        manager.handle(payload(PresenceKind::Join, "self"), &send).await;
        assert!(log.lock().unwrap().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn leave_removes_and_emits() {
        let emitter = EventEmitter::new(64);
        let log = events(&emitter);
        let manager = PresenceManager::new("self", PresenceConfig::default(), emitter);
        let (send, _rx) = collector();
        manager.handle(payload(PresenceKind::Join, "peer-a"), &send).await;
        manager.handle(payload(PresenceKind::Leave, "peer-a"), &send).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["presence:join".to_owned(), "presence:leave".to_owned()]
        );
        assert_eq!(manager.online_count(), 0);

        // Leave for an unknown peer emits nothing.
        manager.handle(payload(PresenceKind::Leave, "ghost"), &send).await;
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_broadcasts_join_then_heartbeats_and_evicts_stale() {
        let emitter = EventEmitter::new(64);
        let log = events(&emitter);
        let config = PresenceConfig {
            heartbeat_interval: Duration::from_millis(100),
            timeout: Duration::from_millis(250),
        };
        let manager = Arc::new(PresenceManager::new("self", config, emitter));
        let (send, mut rx) = collector();

        // Seed a peer that will go stale.
        manager
            .handle(payload(PresenceKind::Heartbeat, "peer-a"), &send)
            .await;

        manager.clone().start(send.clone());
        tokio::task::yield_now().await;
        let (target, first) = rx.recv().await.unwrap();
        assert!(target.is_none());
        assert_eq!(first.pt, PresenceKind::Join);

        let (_, second) = rx.recv().await.unwrap();
        assert_eq!(second.pt, PresenceKind::Heartbeat);

        // After enough ticks the silent peer is evicted.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(manager.online_count(), 0);
        assert!(log
            .lock()
            .unwrap()
            .iter()
            .any(|e| e == "presence:leave"));

        manager.stop();
    }
}
