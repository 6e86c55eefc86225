//! Bus configuration.
//!
//! Plain option structs with defaults; validation happens in the bus
//! constructors.  `strict` refuses wildcard origins outright, and the
//! secure constructor additionally requires a non-empty explicit allowlist.

use crate::error::{BusError, BusResult, ErrorKind};
use crate::presence::PresenceConfig;
use crate::stream::DEFAULT_CHUNK_SIZE;
use serde_json::{Map, Value};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Stable identifier for this bus instance; generated when `None`.
    pub peer_id: Option<String>,
    /// Our own origin: the same-origin reference for the validator and the
    /// origin announced in handshakes.
    pub origin: String,
    /// Exact origins and bounded-wildcard patterns allowed inbound.
    pub allowed_origins: Vec<String>,
    /// Refuse wildcard origins at construction time.
    pub strict: bool,
    /// Metadata announced in handshakes.
    pub meta: Map<String, Value>,
    /// Capabilities announced in handshakes.
    pub capabilities: Vec<String>,
    pub max_peers: usize,
    pub max_pending: usize,
    /// Per-name listener threshold; exceeding it logs a diagnostic.
    pub max_listeners: usize,
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Outgoing stream chunk split threshold (bytes).
    pub chunk_size: usize,
    pub presence: PresenceConfig,
    /// Enable vector-clock stamping and causal delivery for signals.
    pub causal_ordering: bool,
    /// Hold-back buffer capacity for the causal orderer.
    pub causal_buffer: usize,
    /// Reject payloads serializing beyond this size.
    pub max_payload_bytes: Option<usize>,
}

impl Default for BusOptions {
    fn default() -> Self {
        BusOptions {
            peer_id: None,
            origin: "local".to_owned(),
            allowed_origins: Vec::new(),
            strict: false,
            meta: Map::new(),
            capabilities: Vec::new(),
            max_peers: 64,
            max_pending: 256,
            max_listeners: 32,
            request_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            chunk_size: DEFAULT_CHUNK_SIZE,
            presence: PresenceConfig::default(),
            causal_ordering: false,
            causal_buffer: 128,
            max_payload_bytes: None,
        }
    }
}

impl BusOptions {
    /// Shared validation for the normal constructor.
    pub(crate) fn validate(&self) -> BusResult<()> {
        if self.strict && self.allowed_origins.iter().any(|o| o == "*") {
            return Err(BusError::msg(
                ErrorKind::OriginForbidden,
                "strict mode refuses wildcard origins",
            ));
        }
        Ok(())
    }

    /// Extra validation for the secure constructor: explicit origins only.
    pub(crate) fn validate_secure(&self) -> BusResult<()> {
        if self.allowed_origins.is_empty() {
            return Err(BusError::msg(
                ErrorKind::OriginForbidden,
                "secure bus requires explicit allowed origins",
            ));
        }
        if self.allowed_origins.iter().any(|o| o == "*") {
            return Err(BusError::msg(
                ErrorKind::OriginForbidden,
                "secure bus rejects the wildcard origin",
            ));
        }
        Ok(())
    }
}
