//! Inbound and outbound hook pipelines.
//!
//! Hooks are best-effort transforms: the pipeline folds the message value
//! through the hooks in priority order, awaiting each.  A hook that fails
//! is logged and bypassed; the previous value continues down the chain.

use crate::error::BusResult;
use crate::util::Counter;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use tracing::warn;

/// What is flowing through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Signal,
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Context handed to every hook alongside the value.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub class: MessageClass,
    pub direction: Direction,
    pub peer_id: Option<String>,
    pub handler_name: Option<String>,
}

impl HookContext {
    pub fn new(class: MessageClass, direction: Direction) -> Self {
        HookContext {
            class,
            direction,
            peer_id: None,
            handler_name: None,
        }
    }

    pub fn for_peer(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    pub fn for_handler(mut self, handler_name: impl Into<String>) -> Self {
        self.handler_name = Some(handler_name.into());
        self
    }
}

pub type HookFn =
    Arc<dyn Fn(Value, HookContext) -> BoxFuture<'static, BusResult<Value>> + Send + Sync>;

/// Wrap an async closure as a [`HookFn`].
pub fn hook<F, Fut>(f: F) -> HookFn
where
    F: Fn(Value, HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BusResult<Value>> + Send + 'static,
{
    Arc::new(move |value, ctx| Box::pin(f(value, ctx)))
}

struct HookEntry {
    id: u64,
    priority: i32,
    f: HookFn,
}

/// One direction's ordered hook chain.
pub struct HookPipeline {
    hooks: Arc<Mutex<Vec<HookEntry>>>,
    ids: Counter,
}

/// Handle for detaching a hook.  Detaching twice is a no-op.
pub struct HookHandle {
    hooks: Weak<Mutex<Vec<HookEntry>>>,
    id: u64,
}

impl HookHandle {
    pub fn remove(&self) {
        if let Some(hooks) = self.hooks.upgrade() {
            hooks.lock().expect("hook lock").retain(|h| h.id != self.id);
        }
    }
}

impl HookPipeline {
    pub fn new() -> Self {
        HookPipeline {
            hooks: Arc::new(Mutex::new(Vec::new())),
            ids: Counter::default(),
        }
    }

    /// Attach a hook; higher priority runs earlier.
    pub fn add(&self, f: HookFn, priority: i32) -> HookHandle {
        let id = self.ids.next();
        let mut hooks = self.hooks.lock().expect("hook lock");
        let pos = hooks.partition_point(|h| h.priority >= priority);
        hooks.insert(pos, HookEntry { id, priority, f });
        HookHandle {
            hooks: Arc::downgrade(&self.hooks),
            id,
        }
    }

    pub fn len(&self) -> usize {
        self.hooks.lock().expect("hook lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fold `value` through the chain.  Hook *i+1* sees the output of hook
    /// *i*; a failing hook is logged and its input value is propagated
    /// unmodified.
    pub async fn run(&self, value: Value, ctx: &HookContext) -> Value {
        let snapshot: Vec<HookFn> = {
            let hooks = self.hooks.lock().expect("hook lock");
            hooks.iter().map(|h| h.f.clone()).collect()
        };
        let mut current = value;
        for f in snapshot {
            match f(current.clone(), ctx.clone()).await {
                Ok(next) => current = next,
                Err(e) => {
                    warn!(error = %e, direction = ?ctx.direction, "hook failed; bypassing");
                }
            }
        }
        current
    }

    pub fn clear(&self) {
        self.hooks.lock().expect("hook lock").clear();
    }
}

impl Default for HookPipeline {
    fn default() -> Self {
        Self::new()
    }
}
