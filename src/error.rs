//! Bus error model.
//!
//! A single closed set of error categories covers every failure the bus can
//! surface.  Each category carries a stable kebab-case code, a default
//! message, a retryability hint and an operator-facing suggestion.  No retry
//! policy lives here; retry layers consume the hint.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of bus error categories.
///
/// Codes are the kebab-case of the variant name and are wire-stable: a
/// failed response carries `{code, message}` and the requesting side maps
/// the code back through [`ErrorKind::from_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    HandshakeTimeout,
    HandshakeRejected,
    OriginForbidden,
    PeerExists,
    PeerNotFound,
    PeerDisconnected,
    ReconnectFailed,
    AckTimeout,
    ResponseTimeout,
    QueueFull,
    InvalidMessage,
    VersionMismatch,
    CloneError,
    TransferError,
    MessageTooLarge,
    Unreachable,
    TtlExceeded,
    NoRoute,
    NoHandler,
    HandlerError,
    HandlerTimeout,
    HandlerExists,
    SendFailed,
    ChannelFailed,
    ChannelClosed,
    MaxPeers,
    MaxPending,
    Destroyed,
    CircuitOpen,
    PayloadTooLarge,
    RateLimited,
    Unauthorized,
    InvalidPayload,
    RequestCancelled,
}

impl ErrorKind {
    /// (code, retryable, default message, operator suggestion)
    const fn table(self) -> (&'static str, bool, &'static str, &'static str) {
        use ErrorKind::*;
        match self {
            HandshakeTimeout => (
                "handshake-timeout",
                true,
                "Handshake did not complete in time",
                "Check that the remote context is loaded and responsive",
            ),
            HandshakeRejected => (
                "handshake-rejected",
                false,
                "Handshake was rejected by the remote peer",
                "Inspect the remote validator and the declared origin",
            ),
            OriginForbidden => (
                "origin-forbidden",
                false,
                "Message origin is not on the allowlist",
                "Add the origin to allowedOrigins or fix the sender",
            ),
            PeerExists => (
                "peer-exists",
                false,
                "A peer with this identifier is already registered",
                "Remove the existing peer first or pick a unique id",
            ),
            PeerNotFound => (
                "peer-not-found",
                false,
                "No peer registered under this identifier",
                "Verify the peer id and that the handshake completed",
            ),
            PeerDisconnected => (
                "peer-disconnected",
                true,
                "Peer is not connected",
                "Wait for reconnection or re-add the peer",
            ),
            ReconnectFailed => (
                "reconnect-failed",
                true,
                "Reconnection attempts exhausted",
                "Check transport health and retry with backoff",
            ),
            AckTimeout => (
                "ack-timeout",
                true,
                "Acknowledgement did not arrive in time",
                "Increase the ack timeout or check the transport",
            ),
            ResponseTimeout => (
                "response-timeout",
                true,
                "Request timed out waiting for a response",
                "Increase the timeout or verify the remote handler",
            ),
            QueueFull => (
                "queue-full",
                true,
                "Offline queue is at capacity",
                "Drain the queue or raise the queue limit",
            ),
            InvalidMessage => (
                "invalid-message",
                false,
                "Message does not match any known wire shape",
                "Check protocol versions on both ends",
            ),
            VersionMismatch => (
                "version-mismatch",
                false,
                "Peer speaks an incompatible protocol version",
                "Upgrade the older side",
            ),
            CloneError => (
                "clone-error",
                false,
                "Payload is not structurally cloneable",
                "Remove non-serializable values from the payload",
            ),
            TransferError => (
                "transfer-error",
                true,
                "Transferable payload hand-off failed",
                "Retry without transferables",
            ),
            MessageTooLarge => (
                "message-too-large",
                false,
                "Message exceeds the configured size limit",
                "Use a stream for large payloads",
            ),
            Unreachable => (
                "unreachable",
                true,
                "Peer is currently unreachable",
                "Check connectivity and retry",
            ),
            TtlExceeded => (
                "ttl-exceeded",
                false,
                "Message hop limit exceeded",
                "Check for routing loops",
            ),
            NoRoute => (
                "no-route",
                true,
                "No route to the target peer",
                "Add a transport that reaches the target",
            ),
            NoHandler => (
                "no-handler",
                false,
                "No handler registered under this name",
                "Register the handler before sending requests",
            ),
            HandlerError => (
                "handler-error",
                false,
                "Handler failed while processing the request",
                "Inspect the handler's own error output",
            ),
            HandlerTimeout => (
                "handler-timeout",
                true,
                "Handler did not finish in time",
                "Raise the handler timeout or speed up the handler",
            ),
            HandlerExists => (
                "handler-exists",
                false,
                "A handler with this name is already registered",
                "Unregister the existing handler first",
            ),
            SendFailed => (
                "send-failed",
                true,
                "Transport send failed",
                "Check the transport and retry",
            ),
            ChannelFailed => (
                "channel-failed",
                true,
                "Underlying channel failed",
                "Recreate the channel",
            ),
            ChannelClosed => (
                "channel-closed",
                false,
                "Channel is closed",
                "Open a new channel; closed channels never reopen",
            ),
            MaxPeers => (
                "max-peers",
                false,
                "Peer limit reached",
                "Remove unused peers or raise maxPeers",
            ),
            MaxPending => (
                "max-pending",
                true,
                "Too many requests in flight",
                "Apply backpressure or raise maxPending",
            ),
            Destroyed => (
                "destroyed",
                false,
                "Bus instance has been destroyed",
                "Create a new bus instance",
            ),
            CircuitOpen => (
                "circuit-open",
                true,
                "Circuit breaker is open",
                "Wait for the cool-down window",
            ),
            PayloadTooLarge => (
                "payload-too-large",
                false,
                "Payload exceeds the handler's size limit",
                "Shrink the payload or use a stream",
            ),
            RateLimited => (
                "rate-limited",
                true,
                "Handler rate limit exceeded",
                "Slow down or raise the handler's rateLimit",
            ),
            Unauthorized => (
                "unauthorized",
                false,
                "Peer is not allowed to call this handler",
                "Add the peer to the handler's allowedPeers",
            ),
            InvalidPayload => (
                "invalid-payload",
                false,
                "Payload failed handler validation",
                "Fix the payload to match the handler's schema",
            ),
            RequestCancelled => (
                "request-cancelled",
                false,
                "Request was cancelled by the caller",
                "No action needed",
            ),
        }
    }

    /// Stable wire code for this category.
    pub const fn code(self) -> &'static str {
        self.table().0
    }

    /// Whether callers may reasonably retry after this error.
    pub const fn retryable(self) -> bool {
        self.table().1
    }

    pub const fn default_message(self) -> &'static str {
        self.table().2
    }

    pub const fn suggestion(self) -> &'static str {
        self.table().3
    }

    /// Map a wire code back to a category.
    pub fn from_code(code: &str) -> Option<ErrorKind> {
        serde_json::from_value(Value::String(code.to_owned())).ok()
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// A bus failure: a category plus a concrete message and optional details.
///
/// Serializes to `{code, message, retryable, suggestion, details?}`.
#[derive(Debug, Clone, thiserror::Error, Serialize)]
#[error("{kind}: {message}")]
pub struct BusError {
    #[serde(rename = "code")]
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub suggestion: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl BusError {
    /// An error with the category's default message.
    pub fn new(kind: ErrorKind) -> Self {
        BusError {
            kind,
            message: kind.default_message().to_owned(),
            retryable: kind.retryable(),
            suggestion: kind.suggestion(),
            details: None,
        }
    }

    /// An error with a specific message.
    pub fn msg(kind: ErrorKind, message: impl Into<String>) -> Self {
        BusError {
            message: message.into(),
            ..BusError::new(kind)
        }
    }

    /// Attach structured details (peer id, handler name, timeout, ...).
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }
}

pub type BusResult<T> = Result<T, BusError>;
