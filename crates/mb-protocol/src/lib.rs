// mb-protocol: bus wire types and serialization.
//
// Every message on the wire is a JSON object carrying the protocol marker
// under the compact key `mb`.  The `type` field discriminates the message
// kind; payload shapes are kind-specific.  Broadcast delivery may wrap an
// envelope in the short `{id, t, ts, seq, p}` form; `Envelope::normalize`
// converts either shape into the canonical one on the inbound side.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

/// Current protocol version.  The marker field always equals this value.
pub const PROTOCOL_VERSION: u32 = 1;

/// Compact key under which the protocol marker travels.
pub const MARKER_KEY: &str = "mb";

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

/// Wire-stable message kind tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "sig")]
    Signal,
    #[serde(rename = "req")]
    Request,
    #[serde(rename = "res")]
    Response,
    #[serde(rename = "ack")]
    Ack,
    #[serde(rename = "hsk_init")]
    HandshakeInit,
    #[serde(rename = "hsk_ack")]
    HandshakeAck,
    #[serde(rename = "hsk_done")]
    HandshakeDone,
    #[serde(rename = "png")]
    Ping,
    #[serde(rename = "pog")]
    Pong,
    #[serde(rename = "bye")]
    Goodbye,
    #[serde(rename = "bc")]
    Broadcast,
    #[serde(rename = "stream")]
    Stream,
    #[serde(rename = "prs")]
    Presence,
}

impl MessageKind {
    /// The stable tag string for this kind.
    pub fn as_tag(self) -> &'static str {
        match self {
            MessageKind::Signal => "sig",
            MessageKind::Request => "req",
            MessageKind::Response => "res",
            MessageKind::Ack => "ack",
            MessageKind::HandshakeInit => "hsk_init",
            MessageKind::HandshakeAck => "hsk_ack",
            MessageKind::HandshakeDone => "hsk_done",
            MessageKind::Ping => "png",
            MessageKind::Pong => "pog",
            MessageKind::Goodbye => "bye",
            MessageKind::Broadcast => "bc",
            MessageKind::Stream => "stream",
            MessageKind::Presence => "prs",
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The canonical protocol envelope.
///
/// Immutable once constructed: the bus never mutates an envelope after
/// creation, and inbound envelopes are dispatched as-received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol marker; always equals [`PROTOCOL_VERSION`].
    #[serde(rename = "mb")]
    pub marker: u32,
    pub version: u32,
    /// Unique message identifier (UUID v4, string-encoded).
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Creation time, ms since Unix epoch.
    pub timestamp: i64,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
}

impl Envelope {
    /// Construct a fresh envelope with a new identifier and the current time.
    pub fn new(kind: MessageKind, payload: Value) -> Self {
        Envelope {
            marker: PROTOCOL_VERSION,
            version: PROTOCOL_VERSION,
            id: Uuid::new_v4().to_string(),
            kind,
            timestamp: now_ms(),
            payload,
            meta: None,
        }
    }

    /// Attach a metadata map (builder-style; used before first send only).
    pub fn with_meta(mut self, meta: Map<String, Value>) -> Self {
        self.meta = Some(meta);
        self
    }

    /// True when `value` is an object carrying the protocol marker, i.e. is
    /// already a wrapped envelope rather than a bare payload.
    pub fn is_wrapped(value: &Value) -> bool {
        value
            .as_object()
            .and_then(|o| o.get(MARKER_KEY))
            .and_then(Value::as_u64)
            .is_some()
    }

    /// Normalize either wire shape into the canonical envelope.
    ///
    /// Accepts the verbose form (marker + `type`/`payload`) and the short
    /// transport wrap (`{id, t, ts, seq, p}`) used for broadcast delivery.
    /// The short form's `seq` is preserved under `meta.seq`.
    pub fn normalize(value: Value) -> Result<Envelope, WireError> {
        let obj = value.as_object().ok_or(WireError::NotAnObject)?;
        if obj.contains_key(MARKER_KEY) || obj.contains_key("type") {
            return serde_json::from_value(value).map_err(WireError::Malformed);
        }
        if obj.contains_key("t") {
            let short: ShortEnvelope =
                serde_json::from_value(value).map_err(WireError::Malformed)?;
            let mut meta = Map::new();
            meta.insert("seq".to_owned(), json!(short.seq));
            return Ok(Envelope {
                marker: PROTOCOL_VERSION,
                version: PROTOCOL_VERSION,
                id: short.id,
                kind: short.t,
                timestamp: short.ts,
                payload: short.p,
                meta: Some(meta),
            });
        }
        Err(WireError::UnknownShape)
    }

    /// Serialize to a plain JSON value.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("envelope serialization is infallible")
    }
}

/// Short transport envelope used by the router for broadcast delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortEnvelope {
    pub id: String,
    pub t: MessageKind,
    pub ts: i64,
    pub seq: u64,
    pub p: Value,
}

/// Errors from inbound wire parsing.
#[derive(Debug)]
pub enum WireError {
    /// The inbound value is not a JSON object.
    NotAnObject,
    /// Neither the verbose nor the short envelope shape.
    UnknownShape,
    /// Shape recognized but deserialization failed.
    Malformed(serde_json::Error),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::NotAnObject => write!(f, "message is not a JSON object"),
            WireError::UnknownShape => write!(f, "message matches no known wire shape"),
            WireError::Malformed(e) => write!(f, "malformed envelope: {}", e),
        }
    }
}

impl std::error::Error for WireError {}

// ---------------------------------------------------------------------------
// Payload shapes
// ---------------------------------------------------------------------------

/// Source descriptor attached to signals, requests and responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl SourceRef {
    pub fn new(peer_id: impl Into<String>) -> Self {
        SourceRef {
            peer_id: peer_id.into(),
            kind: None,
        }
    }
}

/// Body of `sig` and `bc` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    pub name: String,
    pub data: Value,
    pub source: SourceRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
}

/// Body of `req` messages.  The outer envelope `id` is the correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    pub name: String,
    pub data: Value,
    pub source: SourceRef,
    pub dest: String,
}

/// Error detail carried inside a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: String,
    pub message: String,
}

/// Body of `res` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub request_id: String,
    pub data: Value,
    pub source: SourceRef,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

// ---------------------------------------------------------------------------
// Handshake payloads
// ---------------------------------------------------------------------------

/// Body of `hsk_init`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeInit {
    /// Handshake identifier; correlates init/ack/done.
    pub hid: String,
    pub peer_id: String,
    pub origin: String,
    /// Random hex challenge; advisory, echoed back in the ack `response`.
    pub challenge: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub ts: i64,
}

/// Body of `hsk_ack`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeAck {
    pub hid: String,
    pub peer_id: String,
    pub accept: bool,
    /// Echo of the init challenge when accepting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// Rejection reason when `accept` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Body of `hsk_done`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeDone {
    pub hid: String,
    pub peer_id: String,
    pub success: bool,
}

// ---------------------------------------------------------------------------
// Stream frames
// ---------------------------------------------------------------------------

/// Stream sub-protocol frames, discriminated on `st`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "st", rename_all = "snake_case")]
pub enum StreamFrame {
    /// Advertises a new stream with a logical name and optional metadata.
    Open {
        sid: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<Map<String, Value>>,
    },
    /// One chunk.  `seq` increases monotonically per stream; binary chunks
    /// travel base64-encoded with `b64` set.
    Data {
        sid: String,
        seq: u64,
        d: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        b64: bool,
    },
    /// Graceful completion.
    End { sid: String },
    /// Abnormal termination with a reason string.
    Error { sid: String, reason: String },
}

impl StreamFrame {
    pub fn sid(&self) -> &str {
        match self {
            StreamFrame::Open { sid, .. }
            | StreamFrame::Data { sid, .. }
            | StreamFrame::End { sid }
            | StreamFrame::Error { sid, .. } => sid,
        }
    }
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

/// Presence subtypes carried in the `pt` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceKind {
    Join,
    Leave,
    Heartbeat,
    Update,
}

/// Body of `prs` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub pt: PresenceKind,
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub meta: Map<String, Value>,
    pub ts: i64,
}

/// Body of `png`/`pog` heartbeat messages.  A pong echoes the ping `ts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub ts: i64,
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
