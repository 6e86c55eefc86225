//! Pending-request tracking.
//!
//! Every outbound request registers an entry keyed by its correlation id.
//! The entry resolves on the first of: a matching response, the timeout, a
//! peer disconnect, caller cancellation, or bus teardown.  At most one entry
//! exists per request identifier, and each resolves exactly once (the entry
//! is removed from the table before its deferred fires).

use crate::error::{BusError, BusResult, ErrorKind};
use crate::util::{Counter, deferred, now_ms};
use mb_protocol::ResponsePayload;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

struct PendingEntry {
    target: String,
    handler: String,
    created_at: i64,
    timeout: Duration,
    tx: oneshot::Sender<BusResult<Value>>,
    default_value: Option<Value>,
}

type Table = Mutex<HashMap<String, PendingEntry>>;

/// Correlates responses to in-flight requests.
pub struct PendingRequests {
    table: Arc<Table>,
    ids: Counter,
    max_pending: usize,
}

/// Snapshot row for diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PendingSnapshot {
    pub request_id: String,
    pub target: String,
    pub handler: String,
    pub age_ms: i64,
}

impl PendingRequests {
    pub fn new(max_pending: usize) -> Self {
        PendingRequests {
            table: Arc::new(Mutex::new(HashMap::new())),
            ids: Counter::default(),
            max_pending,
        }
    }

    /// Register a request and arm its timeout.
    ///
    /// Returns the correlation id and the receiving half of the deferred.
    /// On timeout the entry resolves with `default_value` when one was
    /// supplied, otherwise rejects with `response-timeout`.
    pub fn create(
        &self,
        target: &str,
        handler: &str,
        timeout: Duration,
        default_value: Option<Value>,
    ) -> BusResult<(String, oneshot::Receiver<BusResult<Value>>)> {
        let (tx, rx) = deferred();
        let request_id = format!("req_{}_{}", self.ids.next(), now_ms());
        {
            let mut table = self.table.lock().expect("pending lock");
            if table.len() >= self.max_pending {
                return Err(BusError::new(ErrorKind::MaxPending)
                    .with_details(json!({"maxPending": self.max_pending})));
            }
            table.insert(
                request_id.clone(),
                PendingEntry {
                    target: target.to_owned(),
                    handler: handler.to_owned(),
                    created_at: now_ms(),
                    timeout,
                    tx,
                    default_value,
                },
            );
        }
        self.arm_timeout(&request_id, timeout);
        Ok((request_id, rx))
    }

    fn arm_timeout(&self, request_id: &str, timeout: Duration) {
        let weak: Weak<Table> = Arc::downgrade(&self.table);
        let request_id = request_id.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(table) = weak.upgrade() else { return };
            let entry = table.lock().expect("pending lock").remove(&request_id);
            let Some(entry) = entry else { return };
            debug!(request_id, target = entry.target, "request timed out");
            let outcome = match entry.default_value {
                Some(value) => Ok(value),
                None => Err(BusError::new(ErrorKind::ResponseTimeout).with_details(json!({
                    "requestId": request_id,
                    "peerId": entry.target,
                    "handler": entry.handler,
                    "timeoutMs": entry.timeout.as_millis() as u64,
                }))),
            };
            let _ = entry.tx.send(outcome);
        });
    }

    /// Resolve from an inbound response payload.  Returns false when no
    /// entry matches (late or duplicate response).
    pub fn resolve(&self, request_id: &str, response: &ResponsePayload) -> bool {
        let Some(entry) = self.table.lock().expect("pending lock").remove(request_id) else {
            return false;
        };
        let outcome = if response.success {
            Ok(response.data.clone())
        } else {
            let (kind, message) = match &response.error {
                Some(err) => (
                    ErrorKind::from_code(&err.code).unwrap_or(ErrorKind::HandlerError),
                    err.message.clone(),
                ),
                None => (
                    ErrorKind::HandlerError,
                    ErrorKind::HandlerError.default_message().to_owned(),
                ),
            };
            Err(BusError::msg(kind, message).with_details(json!({
                "requestId": request_id,
                "peerId": entry.target,
                "handler": entry.handler,
            })))
        };
        let _ = entry.tx.send(outcome);
        true
    }

    /// Reject with a raw error.
    pub fn reject(&self, request_id: &str, error: BusError) -> bool {
        let Some(entry) = self.table.lock().expect("pending lock").remove(request_id) else {
            return false;
        };
        let _ = entry.tx.send(Err(error));
        true
    }

    /// Caller-initiated cancellation.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.reject(request_id, BusError::new(ErrorKind::RequestCancelled))
    }

    /// Reject every request targeting `peer` with `peer-disconnected`.
    pub fn cancel_for_peer(&self, peer: &str) -> usize {
        let entries: Vec<(String, PendingEntry)> = {
            let mut table = self.table.lock().expect("pending lock");
            let ids: Vec<String> = table
                .iter()
                .filter(|(_, e)| e.target == peer)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| table.remove(&id).map(|e| (id, e)))
                .collect()
        };
        let count = entries.len();
        for (id, entry) in entries {
            let _ = entry.tx.send(Err(BusError::new(ErrorKind::PeerDisconnected)
                .with_details(json!({"requestId": id, "peerId": peer, "handler": entry.handler}))));
        }
        count
    }

    /// Reject everything and empty the table (bus teardown).
    pub fn cancel_all(&self) -> usize {
        let entries: Vec<PendingEntry> = {
            let mut table = self.table.lock().expect("pending lock");
            table.drain().map(|(_, e)| e).collect()
        };
        let count = entries.len();
        for entry in entries {
            let _ = entry.tx.send(Err(BusError::new(ErrorKind::Destroyed)));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.table.lock().expect("pending lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<PendingSnapshot> {
        let now = now_ms();
        self.table
            .lock()
            .expect("pending lock")
            .iter()
            .map(|(id, e)| PendingSnapshot {
                request_id: id.clone(),
                target: e.target.clone(),
                handler: e.handler.clone(),
                age_ms: now - e.created_at,
            })
            .collect()
    }
}
