//! The transport seam.
//!
//! Concrete transports (frame messaging, worker channels, sockets) live
//! outside the core; the bus consumes them through this trait.  A transport
//! pushes outbound values with `send` and surfaces inbound traffic through
//! a channel the bus pumps into `handle_message`.

use crate::error::BusResult;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

/// One inbound message as seen by the transport.
#[derive(Debug)]
pub struct TransportMessage {
    pub msg: Value,
    /// Origin stated by the transport binding for this message.
    pub origin: String,
    /// Peer the transport attributes the message to, when it knows.
    pub peer_id: Option<String>,
}

pub trait Transport: Send + Sync {
    /// Push one wire value toward the remote context.
    fn send(&self, msg: Value) -> BoxFuture<'static, BusResult<()>>;

    /// Hand over the inbound receiver.  Yields `Some` exactly once; the bus
    /// takes it when the transport is wired.
    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<TransportMessage>>;
}

/// Options for wiring a transport into the bus.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    /// Known remote peer id; when absent the bus initiates a handshake.
    pub peer_id: Option<String>,
    /// Fallback origin for messages the transport does not attribute.
    pub origin: Option<String>,
    /// Offline queue capacity for the registered peer.
    pub offline_queue: Option<usize>,
}
