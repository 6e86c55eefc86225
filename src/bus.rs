//! The bus facade.
//!
//! Composes the emitter, router, pending-request tracker, handshake engine,
//! origin validator, hook pipelines, stream registry, presence manager and
//! (optionally) the causal orderer behind one public API.  Inbound traffic
//! enters through `handle_message`: origin check, wire-shape normalization,
//! then dispatch by message kind.  Outbound traffic flows caller → outbound
//! hooks → envelope construction → router → transport.

use crate::clock::{CausalOrderer, VectorClock};
use crate::config::BusOptions;
use crate::emitter::{EventEmitter, Handler, ListenOptions, Subscription};
use crate::error::{BusError, BusResult, ErrorKind};
use crate::handshake::{HandshakeEngine, HandshakeValidator, LocalIdentity, PeerInfo};
use crate::hooks::{Direction, HookContext, HookFn, HookHandle, HookPipeline, MessageClass};
use crate::origin::OriginValidator;
use crate::pending::{PendingRequests, PendingSnapshot};
use crate::presence::{PresenceManager, PresenceSendFn};
use crate::router::{
    BroadcastOptions, PeerConfig, PeerSnapshot, PeerStatus, RouteOutcome, Router, SendFn, send_fn,
};
use crate::stream::{IncomingStream, StreamRegistry, StreamWriter};
use crate::transport::{Transport, TransportOptions};
use crate::util::now_ms;
use futures_util::future::{BoxFuture, join_all};
use mb_protocol::{
    Envelope, HandshakeAck, HandshakeDone, HandshakeInit, HeartbeatPayload, MessageKind,
    PROTOCOL_VERSION, PresencePayload, RequestPayload, ResponseError, ResponsePayload,
    SignalPayload, SourceRef, StreamFrame,
};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Handler registry types
// ---------------------------------------------------------------------------

/// Context passed to request handlers.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub peer_id: String,
    pub request_id: String,
    pub handler_name: String,
}

pub type RequestHandlerFn =
    Arc<dyn Fn(Value, HandlerContext) -> BoxFuture<'static, BusResult<Value>> + Send + Sync>;

pub type PayloadValidator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Security options for a registered handler.
#[derive(Clone, Default)]
pub struct HandlerOptions {
    /// Only these peers may call the handler.
    pub allowed_peers: Option<Vec<String>>,
    /// Calls per second; counted in fixed one-second windows.
    pub rate_limit: Option<u32>,
    /// Reject payloads the validator refuses.
    pub validate: Option<PayloadValidator>,
}

struct RateWindow {
    started: tokio::time::Instant,
    count: u32,
}

struct HandlerEntry {
    f: RequestHandlerFn,
    opts: HandlerOptions,
    rate: RateWindow,
}

/// Unregisters its handler on demand.  Dropping the guard does nothing.
pub struct HandlerGuard {
    inner: Weak<BusInner>,
    name: String,
}

impl std::fmt::Debug for HandlerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerGuard")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl HandlerGuard {
    pub fn unregister(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handlers.lock().expect("handler lock").remove(&self.name);
        }
    }
}

// ---------------------------------------------------------------------------
// Call options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides the bus-wide request timeout.
    pub timeout: Option<Duration>,
    /// Resolve with this value instead of rejecting on timeout.
    pub default_value: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct SignalOptions {
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastRequestOptions {
    pub timeout: Option<Duration>,
    pub exclude: Vec<String>,
    /// Embed per-peer errors in the result instead of failing the call.
    pub ignore_errors: bool,
}

/// Per-peer outcome of a fan-out request.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PeerResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BusError>,
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub peer_id: String,
    pub peers: usize,
    pub pending: usize,
    pub handlers: usize,
    pub listeners: usize,
    pub uptime_ms: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsReport {
    pub health: HealthReport,
    pub peers: Vec<PeerSnapshot>,
    pub pending: Vec<PendingSnapshot>,
    pub handlers: Vec<String>,
    pub inbound_hooks: usize,
    pub outbound_hooks: usize,
    pub open_streams: usize,
    pub presence_online: Vec<String>,
    pub pending_handshakes: usize,
    pub causal_buffered: usize,
}

// ---------------------------------------------------------------------------
// The bus
// ---------------------------------------------------------------------------

type StreamAcceptor = Arc<dyn Fn(IncomingStream) + Send + Sync>;

struct BusInner {
    peer_id: String,
    options: BusOptions,
    emitter: EventEmitter,
    router: Router,
    pending: PendingRequests,
    handshake: HandshakeEngine,
    origin: OriginValidator,
    inbound: HookPipeline,
    outbound: HookPipeline,
    handlers: Mutex<HashMap<String, HandlerEntry>>,
    streams: StreamRegistry,
    stream_acceptor: Mutex<Option<StreamAcceptor>>,
    presence: Arc<PresenceManager>,
    orderer: Option<Mutex<CausalOrderer>>,
    transports: Mutex<Vec<CancellationToken>>,
    destroyed: AtomicBool,
    started_at: i64,
}

/// A cross-context message bus instance.  Cheap to clone; clones share the
/// same underlying bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("peer_id", &self.inner.peer_id)
            .finish_non_exhaustive()
    }
}

impl MessageBus {
    /// Build a bus.  Requires a Tokio runtime (timers and dispatch tasks).
    pub fn new(options: BusOptions) -> BusResult<MessageBus> {
        options.validate()?;
        Ok(Self::build(options))
    }

    /// Hardened constructor: explicit origins only, wildcard rejected.
    pub fn secure(options: BusOptions) -> BusResult<MessageBus> {
        options.validate()?;
        options.validate_secure()?;
        Ok(Self::build(options))
    }

    fn build(options: BusOptions) -> MessageBus {
        let peer_id = options
            .peer_id
            .clone()
            .unwrap_or_else(|| format!("peer_{}", Uuid::new_v4().simple()));
        let emitter = EventEmitter::new(options.max_listeners);
        let router = Router::new(emitter.clone(), &peer_id, options.max_peers);
        let pending = PendingRequests::new(options.max_pending);
        let origin = OriginValidator::new(&options.allowed_origins, &options.origin);
        let handshake = HandshakeEngine::new(
            LocalIdentity {
                peer_id: peer_id.clone(),
                origin: options.origin.clone(),
                meta: options.meta.clone(),
                capabilities: options.capabilities.clone(),
            },
            options.handshake_timeout,
        );
        let presence = Arc::new(PresenceManager::new(
            &peer_id,
            options.presence.clone(),
            emitter.clone(),
        ));

        let (orderer, orderer_rx) = if options.causal_ordering {
            let (tx, rx) = mpsc::unbounded_channel::<Value>();
            let orderer = CausalOrderer::new(
                &peer_id,
                options.causal_buffer,
                Box::new(move |_sender, packed| {
                    let _ = tx.send(packed);
                }),
            );
            (Some(Mutex::new(orderer)), Some(rx))
        } else {
            (None, None)
        };

        let inner = Arc::new(BusInner {
            peer_id,
            options,
            emitter,
            router,
            pending,
            handshake,
            origin,
            inbound: HookPipeline::new(),
            outbound: HookPipeline::new(),
            handlers: Mutex::new(HashMap::new()),
            streams: StreamRegistry::new(),
            stream_acceptor: Mutex::new(None),
            presence,
            orderer,
            transports: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            started_at: now_ms(),
        });

        // Causally-delivered signals come back out of the orderer through
        // this pump and only then reach hooks and listeners.
        if let Some(mut rx) = orderer_rx {
            let weak = Arc::downgrade(&inner);
            tokio::spawn(async move {
                while let Some(packed) = rx.recv().await {
                    let Some(inner) = weak.upgrade() else { break };
                    if let Ok(sig) = serde_json::from_value::<SignalPayload>(packed) {
                        inner.deliver_signal(sig).await;
                    }
                }
            });
        }

        MessageBus { inner }
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    fn ensure_alive(&self) -> BusResult<()> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            Err(BusError::new(ErrorKind::Destroyed))
        } else {
            Ok(())
        }
    }

    fn source(&self) -> SourceRef {
        SourceRef::new(&self.inner.peer_id)
    }

    // -- local events -------------------------------------------------------

    /// Subscribe to local signals (exact, `ns:*` or `*`).
    pub fn on(&self, name: &str, handler: Handler, opts: ListenOptions) -> BusResult<Subscription> {
        self.ensure_alive()?;
        self.inner.emitter.on(name, handler, opts)
    }

    /// Emit a local signal and await awaited-mode listeners.
    pub async fn emit(&self, name: &str, data: Value) -> BusResult<usize> {
        self.ensure_alive()?;
        Ok(self.inner.emitter.emit(name, data, self.source()).await)
    }

    /// Synchronous local dispatch (hot path).
    pub fn emit_sync(&self, name: &str, data: Value) -> BusResult<usize> {
        self.ensure_alive()?;
        Ok(self.inner.emitter.emit_sync(name, data, self.source()))
    }

    // -- remote signals and requests ---------------------------------------

    /// Broadcast a named signal to every connected peer.
    pub async fn signal(
        &self,
        name: &str,
        data: Value,
        opts: SignalOptions,
    ) -> BusResult<RouteOutcome> {
        self.ensure_alive()?;
        self.check_payload_size(&data)?;
        let ctx = HookContext::new(MessageClass::Signal, Direction::Outbound);
        let data = self.inner.outbound.run(data, &ctx).await;
        let payload = SignalPayload {
            name: name.to_owned(),
            data,
            source: self.source(),
            dest: None,
        };
        let value = serde_json::to_value(&payload)
            .map_err(|e| BusError::msg(ErrorKind::CloneError, e.to_string()))?;
        let broadcast_opts = BroadcastOptions {
            exclude: opts.exclude,
            include: None,
        };

        let wire = match self.inner.orderer.as_ref() {
            Some(orderer) => {
                let clock = orderer.lock().expect("orderer lock").tick();
                let mut meta = Map::new();
                meta.insert(
                    "vc".to_owned(),
                    serde_json::to_value(&clock).expect("clock serializes"),
                );
                Envelope::new(MessageKind::Signal, value).with_meta(meta).to_value()
            }
            None => value,
        };
        Ok(self
            .inner
            .router
            .broadcast(MessageKind::Signal, wire, &broadcast_opts)
            .await)
    }

    /// Send a request to one peer and await its response.
    pub async fn request(
        &self,
        peer: &str,
        handler: &str,
        data: Value,
        opts: RequestOptions,
    ) -> BusResult<Value> {
        self.ensure_alive()?;
        if !self.inner.router.has(peer) {
            return Err(
                BusError::new(ErrorKind::PeerNotFound).with_details(json!({"peerId": peer}))
            );
        }
        self.check_payload_size(&data)?;

        let ctx = HookContext::new(MessageClass::Request, Direction::Outbound)
            .for_peer(peer)
            .for_handler(handler);
        let data = self.inner.outbound.run(data, &ctx).await;

        let timeout = opts.timeout.unwrap_or(self.inner.options.request_timeout);
        let (request_id, rx) =
            self.inner
                .pending
                .create(peer, handler, timeout, opts.default_value)?;

        let payload = RequestPayload {
            name: handler.to_owned(),
            data,
            source: self.source(),
            dest: peer.to_owned(),
        };
        // The envelope id is the correlation id.
        let env = Envelope {
            marker: PROTOCOL_VERSION,
            version: PROTOCOL_VERSION,
            id: request_id.clone(),
            kind: MessageKind::Request,
            timestamp: now_ms(),
            payload: serde_json::to_value(&payload)
                .map_err(|e| BusError::msg(ErrorKind::CloneError, e.to_string()))?,
            meta: None,
        };

        let outcome = self
            .inner
            .router
            .route(peer, MessageKind::Request, env.to_value())
            .await;
        if let Some(err) = outcome.error {
            self.inner.pending.reject(&request_id, err);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(BusError::new(ErrorKind::ChannelClosed)),
        }
    }

    /// Fan a request out to every connected peer; returns peer → outcome.
    pub async fn broadcast_request(
        &self,
        handler: &str,
        data: Value,
        opts: BroadcastRequestOptions,
    ) -> BusResult<HashMap<String, PeerResponse>> {
        self.ensure_alive()?;
        let peers: Vec<String> = self
            .inner
            .router
            .connected_ids()
            .into_iter()
            .filter(|p| !opts.exclude.contains(p))
            .collect();

        let calls = peers.iter().map(|peer| {
            self.request(
                peer,
                handler,
                data.clone(),
                RequestOptions {
                    timeout: opts.timeout,
                    default_value: None,
                },
            )
        });
        let results = join_all(calls).await;

        let mut map = HashMap::with_capacity(peers.len());
        let mut first_error: Option<BusError> = None;
        for (peer, result) in peers.into_iter().zip(results) {
            match result {
                Ok(data) => {
                    map.insert(
                        peer,
                        PeerResponse {
                            success: true,
                            data: Some(data),
                            error: None,
                        },
                    );
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e.clone());
                    }
                    map.insert(
                        peer,
                        PeerResponse {
                            success: false,
                            data: None,
                            error: Some(e),
                        },
                    );
                }
            }
        }
        match first_error {
            Some(e) if !opts.ignore_errors => Err(e),
            _ => Ok(map),
        }
    }

    /// Cancel an in-flight request by its correlation id.
    pub fn cancel_request(&self, request_id: &str) -> bool {
        self.inner.pending.cancel(request_id)
    }

    // -- handlers -----------------------------------------------------------

    /// Register a request handler.  Duplicate names fail with
    /// `handler-exists`; the returned guard unregisters.
    pub fn handle<F, Fut>(&self, name: &str, f: F, opts: HandlerOptions) -> BusResult<HandlerGuard>
    where
        F: Fn(Value, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BusResult<Value>> + Send + 'static,
    {
        self.ensure_alive()?;
        let mut handlers = self.inner.handlers.lock().expect("handler lock");
        if handlers.contains_key(name) {
            return Err(
                BusError::new(ErrorKind::HandlerExists).with_details(json!({"handler": name}))
            );
        }
        let f: RequestHandlerFn = Arc::new(move |data, ctx| Box::pin(f(data, ctx)));
        handlers.insert(
            name.to_owned(),
            HandlerEntry {
                f,
                opts,
                rate: RateWindow {
                    started: tokio::time::Instant::now(),
                    count: 0,
                },
            },
        );
        Ok(HandlerGuard {
            inner: Arc::downgrade(&self.inner),
            name: name.to_owned(),
        })
    }

    // -- hooks --------------------------------------------------------------

    pub fn add_inbound_hook(&self, f: HookFn, priority: i32) -> HookHandle {
        self.inner.inbound.add(f, priority)
    }

    pub fn add_outbound_hook(&self, f: HookFn, priority: i32) -> HookHandle {
        self.inner.outbound.add(f, priority)
    }

    // -- peers and transports ----------------------------------------------

    pub async fn add_peer(&self, id: &str, send: SendFn, cfg: PeerConfig) -> BusResult<()> {
        self.ensure_alive()?;
        self.inner.router.add_peer(id, send, cfg).await
    }

    /// Remove a peer; every pending request to it rejects with
    /// `peer-disconnected`.
    pub async fn remove_peer(&self, id: &str) -> BusResult<()> {
        self.ensure_alive()?;
        self.inner.router.remove_peer(id).await?;
        self.inner.pending.cancel_for_peer(id);
        Ok(())
    }

    pub fn get_peer(&self, id: &str) -> Option<PeerSnapshot> {
        self.inner.router.get(id)
    }

    /// Wire a transport: its inbound traffic flows into `handle_message`,
    /// and the remote peer (known or handshaken) sends through it.
    pub async fn add_transport(
        &self,
        transport: Arc<dyn Transport>,
        opts: TransportOptions,
    ) -> BusResult<TransportGuard> {
        self.ensure_alive()?;
        let Some(mut rx) = transport.take_incoming() else {
            return Err(BusError::msg(
                ErrorKind::ChannelFailed,
                "transport incoming channel already taken",
            ));
        };
        let send: SendFn = {
            let t = transport.clone();
            Arc::new(move |value| t.send(value))
        };

        if let Some(peer_id) = opts.peer_id.as_deref() {
            self.inner
                .router
                .add_peer(
                    peer_id,
                    send.clone(),
                    PeerConfig {
                        origin: opts.origin.clone().unwrap_or_default(),
                        offline_queue: opts.offline_queue,
                        ..Default::default()
                    },
                )
                .await?;
        } else {
            // Unknown remote: negotiate identity in the background and
            // register the peer on success.
            let bus = self.clone();
            let hs_send = send.clone();
            tokio::spawn(async move {
                match bus.inner.handshake.initiate(hs_send.clone()).await {
                    Ok(info) => {
                        if let Err(e) = bus
                            .inner
                            .router
                            .add_peer(
                                &info.peer_id,
                                hs_send,
                                PeerConfig {
                                    origin: info.origin.clone(),
                                    meta: info.meta.clone(),
                                    capabilities: info.capabilities.clone(),
                                    ..Default::default()
                                },
                            )
                            .await
                        {
                            if e.kind != ErrorKind::PeerExists {
                                warn!(error = %e, "could not register handshaken peer");
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "transport handshake failed"),
                }
            });
        }

        let token = CancellationToken::new();
        self.inner
            .transports
            .lock()
            .expect("transport lock")
            .push(token.clone());

        let pump_bus = self.clone();
        let pump_token = token.clone();
        let pump_send = send.clone();
        let fallback_origin = opts.origin.clone().unwrap_or_default();
        let fixed_peer = opts.peer_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_token.cancelled() => break,
                    next = rx.recv() => {
                        let Some(tm) = next else {
                            // Transport gone: mark the peer disconnected and
                            // fail its in-flight requests.
                            if let Some(peer) = fixed_peer.as_deref() {
                                pump_bus.inner.router.set_status(peer, PeerStatus::Disconnected).await;
                                pump_bus.inner.pending.cancel_for_peer(peer);
                            }
                            break;
                        };
                        let origin = if tm.origin.is_empty() {
                            fallback_origin.clone()
                        } else {
                            tm.origin
                        };
                        let peer = tm.peer_id.or_else(|| fixed_peer.clone());
                        if let Err(e) = pump_bus
                            .handle_message(tm.msg, &origin, peer.as_deref(), Some(pump_send.clone()))
                            .await
                        {
                            debug!(error = %e, "inbound message rejected");
                        }
                    }
                }
            }
        });

        Ok(TransportGuard {
            inner: Arc::downgrade(&self.inner),
            token,
            peer_id: opts.peer_id,
        })
    }

    /// Initiate a handshake over `send`; registers the remote as a peer.
    pub async fn handshake(&self, send: SendFn) -> BusResult<PeerInfo> {
        self.ensure_alive()?;
        let info = self.inner.handshake.initiate(send.clone()).await?;
        let result = self
            .inner
            .router
            .add_peer(
                &info.peer_id,
                send,
                PeerConfig {
                    origin: info.origin.clone(),
                    meta: info.meta.clone(),
                    capabilities: info.capabilities.clone(),
                    ..Default::default()
                },
            )
            .await;
        if let Err(e) = result {
            if e.kind != ErrorKind::PeerExists {
                return Err(e);
            }
        }
        Ok(info)
    }

    pub fn set_handshake_validator(&self, validator: HandshakeValidator) {
        self.inner.handshake.set_validator(validator);
    }

    // -- streams ------------------------------------------------------------

    /// Open an outbound stream toward `peer`.
    pub async fn open_stream(
        &self,
        peer: &str,
        name: &str,
        meta: Option<Map<String, Value>>,
    ) -> BusResult<StreamWriter> {
        self.ensure_alive()?;
        if !self.inner.router.has(peer) {
            return Err(
                BusError::new(ErrorKind::PeerNotFound).with_details(json!({"peerId": peer}))
            );
        }
        let send = self.peer_send(peer);
        StreamWriter::open(name, meta, self.inner.options.chunk_size, send).await
    }

    /// Install the acceptor invoked for every inbound stream `open`.
    pub fn on_stream<F>(&self, f: F) -> BusResult<()>
    where
        F: Fn(IncomingStream) + Send + Sync + 'static,
    {
        self.ensure_alive()?;
        *self.inner.stream_acceptor.lock().expect("stream acceptor lock") = Some(Arc::new(f));
        Ok(())
    }

    fn peer_send(&self, peer: &str) -> SendFn {
        let weak = Arc::downgrade(&self.inner);
        let peer = peer.to_owned();
        send_fn(move |value| {
            let weak = weak.clone();
            let peer = peer.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return Err(BusError::new(ErrorKind::Destroyed));
                };
                let outcome = inner.router.route(&peer, MessageKind::Stream, value).await;
                match outcome.error {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        })
    }

    // -- presence -----------------------------------------------------------

    /// Announce ourselves and start the heartbeat/eviction loop.
    pub fn start_presence(&self) -> BusResult<()> {
        self.ensure_alive()?;
        self.inner
            .presence
            .clone()
            .start(presence_send(&self.inner));
        Ok(())
    }

    // -- inbound entry point ------------------------------------------------

    /// Entry point for transport-received messages.
    ///
    /// `origin` is gated by the allowlist, `peer_id` attributes the message
    /// when the transport knows the sender, and `reply` (when present) is
    /// preferred over the routing table for responses.
    pub async fn handle_message(
        &self,
        msg: Value,
        origin: &str,
        peer_id: Option<&str>,
        reply: Option<SendFn>,
    ) -> BusResult<()> {
        self.ensure_alive()?;
        if !self.inner.origin.is_allowed(origin) {
            warn!(origin, "inbound message from forbidden origin");
            return Err(
                BusError::new(ErrorKind::OriginForbidden).with_details(json!({"origin": origin}))
            );
        }
        let env = Envelope::normalize(msg)
            .map_err(|e| BusError::msg(ErrorKind::InvalidMessage, e.to_string()))?;
        if let Some(peer) = peer_id {
            self.inner.router.touch(peer);
        }
        self.dispatch(env, origin, peer_id, reply).await
    }

    // -- lifecycle ----------------------------------------------------------

    /// Tear the bus down.  Idempotent.  Rejects every pending request with
    /// `destroyed`, clears handlers, peers and listeners, and leaves the
    /// instance in a state where every further operation fails.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(peer_id = self.inner.peer_id, "destroying bus");

        // Best-effort goodbye to connected peers before the registry goes.
        let bye = json!({"peerId": self.inner.peer_id});
        let _ = self
            .inner
            .router
            .broadcast(MessageKind::Goodbye, bye, &BroadcastOptions::default())
            .await;

        self.inner.presence.stop();
        for token in self.inner.transports.lock().expect("transport lock").drain(..) {
            token.cancel();
        }
        let rejected = self.inner.pending.cancel_all();
        self.inner.handshake.clear();
        self.inner.handlers.lock().expect("handler lock").clear();
        self.inner.streams.clear();
        *self.inner.stream_acceptor.lock().expect("stream acceptor lock") = None;
        self.inner.router.clear();

        // Listeners hear the teardown, then everything is dropped.
        self.inner
            .emitter
            .emit(
                "bus:destroyed",
                json!({"peerId": self.inner.peer_id, "rejectedRequests": rejected}),
                self.source(),
            )
            .await;
        self.inner.emitter.clear();
    }

    // -- operator surfaces --------------------------------------------------

    pub fn health_check(&self) -> HealthReport {
        let destroyed = self.inner.destroyed.load(Ordering::Acquire);
        HealthReport {
            status: if destroyed { "destroyed" } else { "ok" },
            peer_id: self.inner.peer_id.clone(),
            peers: self.inner.router.peer_count(),
            pending: self.inner.pending.len(),
            handlers: self.inner.handlers.lock().expect("handler lock").len(),
            listeners: self.inner.emitter.listener_count(),
            uptime_ms: now_ms() - self.inner.started_at,
        }
    }

    pub fn diagnose(&self) -> DiagnosticsReport {
        DiagnosticsReport {
            health: self.health_check(),
            peers: self.inner.router.list(),
            pending: self.inner.pending.snapshot(),
            handlers: self
                .inner
                .handlers
                .lock()
                .expect("handler lock")
                .keys()
                .cloned()
                .collect(),
            inbound_hooks: self.inner.inbound.len(),
            outbound_hooks: self.inner.outbound.len(),
            open_streams: self.inner.streams.open_count(),
            presence_online: self.inner.presence.online_peers(),
            pending_handshakes: self.inner.handshake.pending_count(),
            causal_buffered: self
                .inner
                .orderer
                .as_ref()
                .map_or(0, |o| o.lock().expect("orderer lock").buffered()),
        }
    }

    fn check_payload_size(&self, data: &Value) -> BusResult<()> {
        if let Some(limit) = self.inner.options.max_payload_bytes {
            let size = serde_json::to_string(data).map(|s| s.len()).unwrap_or(0);
            if size > limit {
                return Err(BusError::new(ErrorKind::MessageTooLarge)
                    .with_details(json!({"size": size, "limit": limit})));
            }
        }
        Ok(())
    }
}

/// Detaches a wired transport: stops the pump and removes the fixed peer.
pub struct TransportGuard {
    inner: Weak<BusInner>,
    token: CancellationToken,
    peer_id: Option<String>,
}

impl TransportGuard {
    pub async fn detach(self) {
        self.token.cancel();
        if let (Some(inner), Some(peer)) = (self.inner.upgrade(), self.peer_id.as_deref()) {
            let _ = inner.router.remove_peer(peer).await;
            inner.pending.cancel_for_peer(peer);
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound dispatch
// ---------------------------------------------------------------------------

impl MessageBus {
    async fn dispatch(
        &self,
        env: Envelope,
        origin: &str,
        peer_id: Option<&str>,
        reply: Option<SendFn>,
    ) -> BusResult<()> {
        match env.kind {
            MessageKind::Signal | MessageKind::Broadcast => {
                let sig: SignalPayload = parse_payload(&env)?;
                if let (Some(orderer), Some(vc)) = (
                    self.inner.orderer.as_ref(),
                    env.meta.as_ref().and_then(|m| m.get("vc")),
                ) {
                    let clock: VectorClock = serde_json::from_value(vc.clone())
                        .map_err(|e| BusError::msg(ErrorKind::InvalidMessage, e.to_string()))?;
                    let sender = sig.source.peer_id.clone();
                    let packed = serde_json::to_value(&sig)
                        .map_err(|e| BusError::msg(ErrorKind::InvalidMessage, e.to_string()))?;
                    orderer
                        .lock()
                        .expect("orderer lock")
                        .receive(&sender, clock, packed);
                    return Ok(());
                }
                self.inner.deliver_signal(sig).await;
                Ok(())
            }
            MessageKind::Request => self.dispatch_request(env, peer_id, reply).await,
            MessageKind::Response => {
                let mut res: ResponsePayload = parse_payload(&env)?;
                if res.success {
                    let ctx = HookContext::new(MessageClass::Response, Direction::Inbound)
                        .for_peer(res.source.peer_id.clone());
                    res.data = self.inner.inbound.run(res.data, &ctx).await;
                }
                if !self.inner.pending.resolve(&res.request_id, &res) {
                    debug!(request_id = res.request_id, "response without pending request");
                }
                Ok(())
            }
            MessageKind::HandshakeInit => {
                let init: HandshakeInit = parse_payload(&env)?;
                let Some(reply) = reply else {
                    warn!(hid = init.hid, "handshake init without a reply path");
                    return Ok(());
                };
                self.inner.handshake.handle_init(init, origin, reply).await;
                Ok(())
            }
            MessageKind::HandshakeAck => {
                let ack: HandshakeAck = parse_payload(&env)?;
                self.inner.handshake.handle_ack(ack, origin).await;
                Ok(())
            }
            MessageKind::HandshakeDone => {
                let done: HandshakeDone = parse_payload(&env)?;
                if let (Some(info), Some(reply)) = (self.inner.handshake.handle_done(done), reply)
                {
                    let result = self
                        .inner
                        .router
                        .add_peer(
                            &info.peer_id,
                            reply,
                            PeerConfig {
                                origin: info.origin.clone(),
                                meta: info.meta.clone(),
                                capabilities: info.capabilities.clone(),
                                ..Default::default()
                            },
                        )
                        .await;
                    if let Err(e) = result {
                        if e.kind != ErrorKind::PeerExists {
                            warn!(error = %e, "could not register handshaken peer");
                        }
                    }
                }
                Ok(())
            }
            MessageKind::Ping => {
                let ping: HeartbeatPayload = parse_payload(&env)?;
                let pong = Envelope::new(
                    MessageKind::Pong,
                    serde_json::to_value(&HeartbeatPayload { ts: ping.ts })
                        .expect("heartbeat serializes"),
                );
                if let Some(reply) = reply {
                    let _ = reply(pong.to_value()).await;
                } else if let Some(peer) = peer_id {
                    let _ = self
                        .inner
                        .router
                        .route(peer, MessageKind::Pong, pong.to_value())
                        .await;
                }
                Ok(())
            }
            MessageKind::Pong | MessageKind::Ack => {
                // last-seen already refreshed at the entry point
                Ok(())
            }
            MessageKind::Goodbye => {
                let peer = peer_id
                    .map(str::to_owned)
                    .or_else(|| env.payload.get("peerId").and_then(Value::as_str).map(str::to_owned));
                if let Some(peer) = peer {
                    debug!(peer_id = peer, "peer said goodbye");
                    let _ = self.inner.router.remove_peer(&peer).await;
                    self.inner.pending.cancel_for_peer(&peer);
                }
                Ok(())
            }
            MessageKind::Stream => {
                let frame: StreamFrame = parse_payload(&env)?;
                let from = peer_id.unwrap_or("unknown");
                if let Some(incoming) = self.inner.streams.handle_frame(frame, from) {
                    let acceptor = self
                        .inner
                        .stream_acceptor
                        .lock()
                        .expect("stream acceptor lock")
                        .clone();
                    match acceptor {
                        Some(f) => f(incoming),
                        None => warn!(
                            sid = incoming.sid,
                            name = incoming.name,
                            "inbound stream without an acceptor"
                        ),
                    }
                }
                Ok(())
            }
            MessageKind::Presence => {
                let payload: PresencePayload = parse_payload(&env)?;
                self.inner.router.touch(&payload.peer_id);
                let send = presence_send(&self.inner);
                self.inner.presence.handle(payload, &send).await;
                Ok(())
            }
        }
    }

    async fn dispatch_request(
        &self,
        env: Envelope,
        peer_id: Option<&str>,
        reply: Option<SendFn>,
    ) -> BusResult<()> {
        let req: RequestPayload = parse_payload(&env)?;
        let request_id = env.id.clone();
        let from_peer = peer_id
            .map(str::to_owned)
            .unwrap_or_else(|| req.source.peer_id.clone());

        enum Gate {
            Run(RequestHandlerFn),
            Refuse(ErrorKind),
            Drop,
        }

        let gate = {
            let mut handlers = self.inner.handlers.lock().expect("handler lock");
            match handlers.get_mut(&req.name) {
                // No handler: drop silently so the caller's timeout (and
                // any default value) governs the outcome.
                None => Gate::Drop,
                Some(entry) => {
                    if entry
                        .opts
                        .allowed_peers
                        .as_ref()
                        .is_some_and(|allowed| !allowed.contains(&from_peer))
                    {
                        Gate::Refuse(ErrorKind::Unauthorized)
                    } else if over_rate_limit(entry) {
                        Gate::Refuse(ErrorKind::RateLimited)
                    } else if entry.opts.validate.as_ref().is_some_and(|v| !v(&req.data)) {
                        Gate::Refuse(ErrorKind::InvalidPayload)
                    } else {
                        Gate::Run(entry.f.clone())
                    }
                }
            }
        };

        let response = match gate {
            Gate::Drop => {
                debug!(handler = req.name, "request for unregistered handler dropped");
                return Ok(());
            }
            Gate::Refuse(kind) => {
                warn!(handler = req.name, peer_id = from_peer, code = kind.code(), "request refused");
                ResponsePayload {
                    request_id: request_id.clone(),
                    data: Value::Null,
                    source: SourceRef::new(&self.inner.peer_id),
                    success: false,
                    error: Some(ResponseError {
                        code: kind.code().to_owned(),
                        message: kind.default_message().to_owned(),
                    }),
                }
            }
            Gate::Run(f) => {
                let ctx = HookContext::new(MessageClass::Request, Direction::Inbound)
                    .for_peer(from_peer.clone())
                    .for_handler(req.name.clone());
                let data = self.inner.inbound.run(req.data, &ctx).await;
                let handler_ctx = HandlerContext {
                    peer_id: from_peer.clone(),
                    request_id: request_id.clone(),
                    handler_name: req.name.clone(),
                };
                match f(data, handler_ctx).await {
                    Ok(result) => {
                        let ctx = HookContext::new(MessageClass::Response, Direction::Outbound)
                            .for_peer(from_peer.clone())
                            .for_handler(req.name.clone());
                        let result = self.inner.outbound.run(result, &ctx).await;
                        ResponsePayload {
                            request_id: request_id.clone(),
                            data: result,
                            source: SourceRef::new(&self.inner.peer_id),
                            success: true,
                            error: None,
                        }
                    }
                    Err(e) => ResponsePayload {
                        request_id: request_id.clone(),
                        data: Value::Null,
                        source: SourceRef::new(&self.inner.peer_id),
                        success: false,
                        error: Some(ResponseError {
                            code: ErrorKind::HandlerError.code().to_owned(),
                            message: e.message,
                        }),
                    },
                }
            }
        };

        let env = Envelope::new(
            MessageKind::Response,
            serde_json::to_value(&response)
                .map_err(|e| BusError::msg(ErrorKind::CloneError, e.to_string()))?,
        );
        match reply {
            Some(reply) => reply(env.to_value()).await,
            None => {
                let outcome = self
                    .inner
                    .router
                    .route(&from_peer, MessageKind::Response, env.to_value())
                    .await;
                match outcome.error {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        }
    }
}

impl BusInner {
    /// Final leg for signals: inbound hooks, then the local emitter.
    async fn deliver_signal(&self, sig: SignalPayload) {
        let ctx = HookContext::new(MessageClass::Signal, Direction::Inbound)
            .for_peer(sig.source.peer_id.clone());
        let data = self.inbound.run(sig.data, &ctx).await;
        self.emitter.emit(&sig.name, data, sig.source).await;
    }
}

/// Count the call against the handler's fixed one-second window.
fn over_rate_limit(entry: &mut HandlerEntry) -> bool {
    let Some(limit) = entry.opts.rate_limit else {
        return false;
    };
    let now = tokio::time::Instant::now();
    if now.duration_since(entry.rate.started) >= Duration::from_secs(1) {
        entry.rate.started = now;
        entry.rate.count = 0;
    }
    entry.rate.count += 1;
    entry.rate.count > limit
}

fn parse_payload<T: serde::de::DeserializeOwned>(env: &Envelope) -> BusResult<T> {
    serde_json::from_value(env.payload.clone())
        .map_err(|e| BusError::msg(ErrorKind::InvalidMessage, e.to_string()))
}

fn presence_send(inner: &Arc<BusInner>) -> PresenceSendFn {
    let weak = Arc::downgrade(inner);
    Arc::new(move |target, payload| {
        let weak = weak.clone();
        Box::pin(async move {
            let Some(inner) = weak.upgrade() else { return };
            let Ok(value) = serde_json::to_value(&payload) else { return };
            match target {
                Some(peer) => {
                    let _ = inner.router.route(&peer, MessageKind::Presence, value).await;
                }
                None => {
                    let _ = inner
                        .router
                        .broadcast(MessageKind::Presence, value, &BroadcastOptions::default())
                        .await;
                }
            }
        })
    })
}
