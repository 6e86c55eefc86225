//! Local event dispatch.
//!
//! Listeners subscribe under an exact name, a namespace wildcard (`ns:*`,
//! matching every name with prefix `ns:`) or the global wildcard (`*`).
//! Matching is three fixed map lookups; no per-message pattern scanning.
//! Per name, entries are held in descending priority order; ties preserve
//! registration order.
//!
//! Two dispatch paths exist.  `emit` wraps the payload in a [`SignalEvent`]
//! and walks the full entries (awaiting awaited-mode listeners, spawning
//! fire-and-forget ones).  `emit_sync` is the hot path: it serves plain
//! names from a memoized callable-only cache with an unrolled sequence for
//! up to four listeners.

use crate::error::{BusError, BusResult, ErrorKind};
use crate::util::{Counter, now_ms};
use futures_util::future::BoxFuture;
use mb_protocol::SourceRef;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Events and handlers
// ---------------------------------------------------------------------------

/// The event every listener receives on the async path.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SignalEvent {
    pub name: String,
    pub data: Value,
    /// Fresh identifier per emission.
    pub id: String,
    pub timestamp: i64,
    pub source: SourceRef,
}

impl SignalEvent {
    fn new(name: &str, data: Value, source: SourceRef) -> Self {
        SignalEvent {
            name: name.to_owned(),
            data,
            id: Uuid::new_v4().to_string(),
            timestamp: now_ms(),
            source,
        }
    }
}

/// A listener callable: synchronous, or asynchronous (returning a future).
#[derive(Clone)]
pub enum Handler {
    Sync(Arc<dyn Fn(&SignalEvent) + Send + Sync>),
    Async(Arc<dyn Fn(SignalEvent) -> BoxFuture<'static, ()> + Send + Sync>),
}

impl Handler {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&SignalEvent) + Send + Sync + 'static,
    {
        Handler::Sync(Arc::new(f))
    }

    pub fn async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(SignalEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Handler::Async(Arc::new(move |ev| Box::pin(f(ev))))
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Sync(_) => f.write_str("Handler::Sync"),
            Handler::Async(_) => f.write_str("Handler::Async"),
        }
    }
}

/// How the async dispatch path treats a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Awaited before the next listener runs.
    #[default]
    Awaited,
    /// Scheduled as a task; relative completion order unspecified.
    Spawned,
}

/// Subscription options.
#[derive(Debug, Clone, Default)]
pub struct ListenOptions {
    /// Higher runs first.
    pub priority: i32,
    pub mode: DispatchMode,
    /// Deliver exactly once, then remove the entry.
    pub once: bool,
    /// Abort token; a token already cancelled at registration means the
    /// entry is never stored.
    pub cancel: Option<CancellationToken>,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct ListenerEntry {
    id: String,
    priority: i32,
    mode: DispatchMode,
    once: bool,
    consumed: AtomicBool,
    cancel: Option<CancellationToken>,
    handler: Handler,
}

impl ListenerEntry {
    /// Plain entries are eligible for the callable-only fast cache.
    fn is_plain(&self) -> bool {
        !self.once && self.cancel.is_none()
    }
}

struct State {
    by_name: HashMap<String, Vec<Arc<ListenerEntry>>>,
    /// Memoized per-emitted-name callable lists; cleared on any mutation.
    fast: HashMap<String, Arc<Vec<Handler>>>,
    total: usize,
}

struct Inner {
    state: Mutex<State>,
    ids: Counter,
    max_listeners: usize,
}

/// The local event emitter.  Cheap to clone; clones share state.
#[derive(Clone)]
pub struct EventEmitter {
    inner: Arc<Inner>,
}

/// Opaque subscription handle; its sole capability is cancellation.
pub struct Subscription {
    emitter: Weak<Inner>,
    name: String,
    id: String,
}

impl Subscription {
    /// Remove the underlying listener.  Idempotent.
    pub fn cancel(&self) {
        if let Some(inner) = self.emitter.upgrade() {
            remove_entry(&inner, &self.name, &self.id);
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl EventEmitter {
    pub fn new(max_listeners: usize) -> Self {
        EventEmitter {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    by_name: HashMap::new(),
                    fast: HashMap::new(),
                    total: 0,
                }),
                ids: Counter::default(),
                max_listeners,
            }),
        }
    }

    /// Register a listener under `name` (exact, `ns:*` or `*`).
    pub fn on(&self, name: &str, handler: Handler, opts: ListenOptions) -> BusResult<Subscription> {
        if name.is_empty() {
            return Err(BusError::msg(
                ErrorKind::InvalidPayload,
                "listener name must be non-empty",
            ));
        }

        let id = format!("sub_{}", self.inner.ids.next());
        let sub = Subscription {
            emitter: Arc::downgrade(&self.inner),
            name: name.to_owned(),
            id: id.clone(),
        };

        // Already-tripped tokens mean the entry is removed immediately, so
        // it is simply never stored.
        if opts.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Ok(sub);
        }

        let entry = Arc::new(ListenerEntry {
            id: id.clone(),
            priority: opts.priority,
            mode: opts.mode,
            once: opts.once,
            consumed: AtomicBool::new(false),
            cancel: opts.cancel.clone(),
            handler,
        });

        {
            let mut state = self.inner.state.lock().expect("emitter lock");
            let list = state.by_name.entry(name.to_owned()).or_default();
            insert_sorted(list, entry);
            let len = list.len();
            state.total += 1;
            state.fast.clear();
            if len > self.inner.max_listeners {
                warn!(
                    name,
                    count = len,
                    max = self.inner.max_listeners,
                    "listener count exceeds threshold"
                );
            }
        }

        if let Some(token) = opts.cancel {
            let weak = Arc::downgrade(&self.inner);
            let (name, id) = (name.to_owned(), id);
            tokio::spawn(async move {
                token.cancelled().await;
                if let Some(inner) = weak.upgrade() {
                    remove_entry(&inner, &name, &id);
                }
            });
        }

        Ok(sub)
    }

    /// Synchronous hot path: invoke matching callables and return the count.
    ///
    /// Plain names (no once-listeners, no abort tokens among the matches)
    /// are served from the fast cache with an unrolled call sequence for up
    /// to four listeners.  Async handlers reached on this path are spawned,
    /// not awaited.
    pub fn emit_sync(&self, name: &str, data: Value, source: SourceRef) -> usize {
        let cached = {
            let state = self.inner.state.lock().expect("emitter lock");
            state.fast.get(name).cloned()
        };

        let handlers = match cached {
            Some(h) => h,
            None => {
                let mut state = self.inner.state.lock().expect("emitter lock");
                let entries = matching(&state, name);
                if entries.iter().all(|e| e.is_plain()) {
                    let callables: Arc<Vec<Handler>> =
                        Arc::new(entries.iter().map(|e| e.handler.clone()).collect());
                    state.fast.insert(name.to_owned(), callables.clone());
                    callables
                } else {
                    // Mixed entries cannot be cached without metadata; walk
                    // them inline.
                    drop(state);
                    return self.dispatch_entries_sync(entries, name, data, source);
                }
            }
        };

        if handlers.is_empty() {
            return 0;
        }
        let event = SignalEvent::new(name, data, source);
        // Unrolled sequence for the common 1-4 listener cases.
        match handlers.len() {
            1 => {
                invoke_sync(&handlers[0], &event);
            }
            2 => {
                invoke_sync(&handlers[0], &event);
                invoke_sync(&handlers[1], &event);
            }
            3 => {
                invoke_sync(&handlers[0], &event);
                invoke_sync(&handlers[1], &event);
                invoke_sync(&handlers[2], &event);
            }
            4 => {
                invoke_sync(&handlers[0], &event);
                invoke_sync(&handlers[1], &event);
                invoke_sync(&handlers[2], &event);
                invoke_sync(&handlers[3], &event);
            }
            _ => {
                for h in handlers.iter() {
                    invoke_sync(h, &event);
                }
            }
        }
        handlers.len()
    }

    /// Asynchronous dispatch: wrap `data` in a [`SignalEvent`] and deliver
    /// to every matching listener in priority order.  Returns the number of
    /// listeners invoked.
    pub async fn emit(&self, name: &str, data: Value, source: SourceRef) -> usize {
        let entries = {
            let state = self.inner.state.lock().expect("emitter lock");
            matching(&state, name)
        };
        if entries.is_empty() {
            return 0;
        }

        let event = SignalEvent::new(name, data, source);
        let mut count = 0usize;
        for entry in &entries {
            if entry.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                continue;
            }
            // Exactly-once: claim the entry before invoking so a concurrent
            // emission cannot deliver it twice.
            if entry.once && entry.consumed.swap(true, Ordering::AcqRel) {
                continue;
            }
            count += 1;
            match (&entry.mode, &entry.handler) {
                (DispatchMode::Awaited, Handler::Sync(f)) => f(&event),
                (DispatchMode::Awaited, Handler::Async(f)) => f(event.clone()).await,
                (DispatchMode::Spawned, Handler::Sync(f)) => {
                    let f = f.clone();
                    let ev = event.clone();
                    tokio::spawn(async move { f(&ev) });
                }
                (DispatchMode::Spawned, Handler::Async(f)) => {
                    tokio::spawn(f(event.clone()));
                }
            }
            if entry.once {
                remove_entry(&self.inner, name, &entry.id);
            }
        }
        count
    }

    /// Total registered listeners (diagnostics).
    pub fn listener_count(&self) -> usize {
        self.inner.state.lock().expect("emitter lock").total
    }

    /// Drop every listener.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock().expect("emitter lock");
        state.by_name.clear();
        state.fast.clear();
        state.total = 0;
        debug!("emitter cleared");
    }

    fn dispatch_entries_sync(
        &self,
        entries: Vec<Arc<ListenerEntry>>,
        name: &str,
        data: Value,
        source: SourceRef,
    ) -> usize {
        if entries.is_empty() {
            return 0;
        }
        let event = SignalEvent::new(name, data, source);
        let mut count = 0usize;
        for entry in &entries {
            if entry.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                continue;
            }
            if entry.once && entry.consumed.swap(true, Ordering::AcqRel) {
                continue;
            }
            count += 1;
            invoke_sync(&entry.handler, &event);
            if entry.once {
                remove_entry(&self.inner, name, &entry.id);
            }
        }
        count
    }
}

fn invoke_sync(handler: &Handler, event: &SignalEvent) {
    match handler {
        Handler::Sync(f) => f(event),
        Handler::Async(f) => {
            tokio::spawn(f(event.clone()));
        }
    }
}

/// Insert keeping descending priority; equal priorities keep registration
/// order.  Binary search only when the new priority beats the current tail.
fn insert_sorted(list: &mut Vec<Arc<ListenerEntry>>, entry: Arc<ListenerEntry>) {
    match list.last() {
        Some(last) if entry.priority > last.priority => {
            let pos = list.partition_point(|e| e.priority >= entry.priority);
            list.insert(pos, entry);
        }
        _ => list.push(entry),
    }
}

/// Collect matching entries: exact, global (`*`), namespace (`ns:*`).
/// A single contributing list is returned as-is; multiple lists are
/// merge-sorted by descending priority, stable within and across lists.
fn matching(state: &State, name: &str) -> Vec<Arc<ListenerEntry>> {
    let exact = state.by_name.get(name);
    let global = if name == "*" { None } else { state.by_name.get("*") };
    let ns_key;
    let namespace = match name.find(':') {
        Some(pos) if !name.ends_with(":*") => {
            ns_key = format!("{}:*", &name[..pos]);
            state.by_name.get(&ns_key)
        }
        _ => None,
    };

    let mut lists: Vec<&Vec<Arc<ListenerEntry>>> = Vec::with_capacity(3);
    for l in [exact, global, namespace].into_iter().flatten() {
        if !l.is_empty() {
            lists.push(l);
        }
    }
    match lists.len() {
        0 => Vec::new(),
        1 => lists[0].clone(),
        _ => merge_by_priority(&lists),
    }
}

fn merge_by_priority(lists: &[&Vec<Arc<ListenerEntry>>]) -> Vec<Arc<ListenerEntry>> {
    let total: usize = lists.iter().map(|l| l.len()).sum();
    let mut out = Vec::with_capacity(total);
    let mut cursors = vec![0usize; lists.len()];
    for _ in 0..total {
        let mut best: Option<usize> = None;
        for (i, list) in lists.iter().enumerate() {
            if cursors[i] >= list.len() {
                continue;
            }
            match best {
                None => best = Some(i),
                Some(b) => {
                    if list[cursors[i]].priority > lists[b][cursors[b]].priority {
                        best = Some(i);
                    }
                }
            }
        }
        let b = best.expect("total bounds the loop");
        out.push(lists[b][cursors[b]].clone());
        cursors[b] += 1;
    }
    out
}

fn remove_entry(inner: &Arc<Inner>, name: &str, id: &str) {
    let mut state = inner.state.lock().expect("emitter lock");
    let mut removed = false;
    if let Some(list) = state.by_name.get_mut(name) {
        if let Some(pos) = list.iter().position(|e| e.id == id) {
            list.remove(pos);
            removed = true;
        }
        if list.is_empty() {
            state.by_name.remove(name);
        }
    }
    if !removed {
        // A wildcard-matched once-listener is stored under its wildcard key;
        // scan the remaining lists for the id.
        let mut empty_key = None;
        for (key, list) in state.by_name.iter_mut() {
            if let Some(pos) = list.iter().position(|e| e.id == id) {
                list.remove(pos);
                removed = true;
                if list.is_empty() {
                    empty_key = Some(key.clone());
                }
                break;
            }
        }
        if let Some(key) = empty_key {
            state.by_name.remove(&key);
        }
    }
    if removed {
        state.total = state.total.saturating_sub(1);
        state.fast.clear();
    }
}
