//! Channel-backed in-memory transport.
//!
//! Two crossed unbounded channels stand in for a real frame/worker/socket
//! binding.  Each side stamps outbound messages with its own origin and
//! peer id so the receiving bus sees properly attributed traffic.

use futures_util::future::BoxFuture;
use mesh_bus::{BusError, BusResult, ErrorKind, Transport, TransportMessage};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub struct MemoryTransport {
    outgoing: mpsc::UnboundedSender<TransportMessage>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<TransportMessage>>>,
    /// Origin stamped on messages this side sends.
    origin: String,
    /// Peer id the remote should attribute our messages to.
    peer_id: String,
}

impl Transport for MemoryTransport {
    fn send(&self, msg: Value) -> BoxFuture<'static, BusResult<()>> {
        let result = self
            .outgoing
            .send(TransportMessage {
                msg,
                origin: self.origin.clone(),
                peer_id: Some(self.peer_id.clone()),
            })
            .map_err(|_| BusError::new(ErrorKind::ChannelClosed));
        Box::pin(async move { result })
    }

    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<TransportMessage>> {
        self.incoming.lock().expect("incoming lock").take()
    }
}

/// Build a crossed pair: whatever `a` sends arrives on `b`'s incoming
/// channel attributed to `a_id`/`a_origin`, and vice versa.
pub fn memory_pair(
    a_id: &str,
    a_origin: &str,
    b_id: &str,
    b_origin: &str,
) -> (Arc<MemoryTransport>, Arc<MemoryTransport>) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let a = Arc::new(MemoryTransport {
        outgoing: b_tx,
        incoming: Mutex::new(Some(a_rx)),
        origin: a_origin.to_owned(),
        peer_id: a_id.to_owned(),
    });
    let b = Arc::new(MemoryTransport {
        outgoing: a_tx,
        incoming: Mutex::new(Some(b_rx)),
        origin: b_origin.to_owned(),
        peer_id: b_id.to_owned(),
    });
    (a, b)
}
