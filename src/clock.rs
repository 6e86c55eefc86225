//! Vector clocks and causal delivery.
//!
//! Each participant owns one component of the clock.  A message is stamped
//! with the sender's clock after a tick; the receiving orderer holds it back
//! until every causal predecessor has been delivered.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tracing::warn;

// ---------------------------------------------------------------------------
// VectorClock
// ---------------------------------------------------------------------------

/// Owner identifier plus a mapping from peer identifier to counter.
/// Missing components read as 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorClock {
    owner: String,
    counters: HashMap<String, u64>,
}

impl VectorClock {
    pub fn new(owner: impl Into<String>) -> Self {
        VectorClock {
            owner: owner.into(),
            counters: HashMap::new(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn get(&self, peer: &str) -> u64 {
        self.counters.get(peer).copied().unwrap_or(0)
    }

    /// Increment the owner's component and return a snapshot to attach to
    /// an outbound message.
    pub fn tick(&mut self) -> VectorClock {
        *self.counters.entry(self.owner.clone()).or_insert(0) += 1;
        self.clone()
    }

    /// Component-wise maximum with `other`.
    pub fn update(&mut self, other: &VectorClock) {
        for (peer, &count) in &other.counters {
            let local = self.counters.entry(peer.clone()).or_insert(0);
            if count > *local {
                *local = count;
            }
        }
    }

    /// `self` happens-before `other`: every component ≤ and at least one <.
    pub fn happened_before(&self, other: &VectorClock) -> bool {
        let mut strictly_less = false;
        for (peer, &count) in &self.counters {
            let theirs = other.get(peer);
            if count > theirs {
                return false;
            }
            if count < theirs {
                strictly_less = true;
            }
        }
        if !strictly_less {
            // Components only they carry can still make the relation strict.
            strictly_less = other
                .counters
                .iter()
                .any(|(peer, &count)| count > self.get(peer));
        }
        strictly_less
    }

    /// Neither happens-before the other, and the clocks differ.
    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        !self.happened_before(other) && !other.happened_before(self) && !self.same_counters(other)
    }

    fn same_counters(&self, other: &VectorClock) -> bool {
        let keys = self.counters.keys().chain(other.counters.keys());
        for key in keys {
            if self.get(key) != other.get(key) {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// CausalOrderer
// ---------------------------------------------------------------------------

/// A message held back until its causal predecessors arrive.
#[derive(Debug, Clone)]
struct Buffered {
    sender: String,
    clock: VectorClock,
    payload: Value,
}

type DeliverFn = Box<dyn FnMut(&str, Value) + Send>;
type OverflowFn = Box<dyn FnMut(&str, &Value) + Send>;

/// Enforces per-sender causal delivery with a bounded hold-back buffer.
pub struct CausalOrderer {
    clock: VectorClock,
    buffer: VecDeque<Buffered>,
    capacity: usize,
    deliver: DeliverFn,
    on_overflow: Option<OverflowFn>,
}

impl CausalOrderer {
    pub fn new(owner: impl Into<String>, capacity: usize, deliver: DeliverFn) -> Self {
        CausalOrderer {
            clock: VectorClock::new(owner),
            buffer: VecDeque::new(),
            capacity,
            deliver,
            on_overflow: None,
        }
    }

    /// Callback invoked when a message is dropped because the buffer is full.
    pub fn on_overflow(&mut self, f: OverflowFn) {
        self.on_overflow = Some(f);
    }

    /// Stamp an outbound message: tick and return the clock snapshot.
    pub fn tick(&mut self) -> VectorClock {
        self.clock.tick()
    }

    pub fn local_clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// The delivery predicate: the sender's component must be exactly one
    /// ahead of ours, and no other component may be ahead of ours.
    fn can_deliver(&self, message_clock: &VectorClock, sender: &str) -> bool {
        if message_clock.get(sender) != self.clock.get(sender) + 1 {
            return false;
        }
        message_clock
            .counters
            .iter()
            .all(|(peer, &count)| peer == sender || count <= self.clock.get(peer))
    }

    /// Accept a message: deliver now when eligible (then drain the buffer),
    /// otherwise hold it back.
    pub fn receive(&mut self, sender: &str, message_clock: VectorClock, payload: Value) {
        if self.can_deliver(&message_clock, sender) {
            self.clock.update(&message_clock);
            (self.deliver)(sender, payload);
            self.drain();
            return;
        }

        if self.buffer.len() >= self.capacity {
            warn!(sender, buffered = self.buffer.len(), "causal buffer full; dropping message");
            if let Some(cb) = self.on_overflow.as_mut() {
                cb(sender, &payload);
            }
            return;
        }
        self.buffer.push_back(Buffered {
            sender: sender.to_owned(),
            clock: message_clock,
            payload,
        });
    }

    /// Every clock advance can unlock buffered messages; re-scan from the
    /// tail toward the head until a full pass delivers nothing.
    fn drain(&mut self) {
        loop {
            let mut delivered_any = false;
            let mut idx = self.buffer.len();
            while idx > 0 {
                idx -= 1;
                let eligible = {
                    let b = &self.buffer[idx];
                    self.can_deliver(&b.clock, &b.sender)
                };
                if eligible {
                    let b = self.buffer.remove(idx).expect("index in bounds");
                    self.clock.update(&b.clock);
                    (self.deliver)(&b.sender, b.payload);
                    delivered_any = true;
                }
            }
            if !delivered_any {
                break;
            }
        }
    }
}
