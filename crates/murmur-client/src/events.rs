//! Subscriber registries for accepted messages and peer status changes.
//!
//! Handlers run synchronously, in registration order, on the task that
//! emits. A panicking handler is logged and skipped; the others still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::error;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Returned by every `on_*` registration; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Subscribers<T> {
    kind: &'static str,
    handlers: RwLock<Vec<(SubscriptionHandle, Handler<T>)>>,
}

impl<T> Subscribers<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let handle = SubscriptionHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((handle, Arc::new(handler)));
        handle
    }

    /// Returns `false` when the handle was not registered here.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != handle);
        handlers.len() != before
    }

    /// Invoke every handler with `value`. Returns how many of them panicked.
    pub fn emit(&self, value: &T) -> usize {
        // Snapshot so handlers may (un)subscribe without deadlocking.
        let snapshot: Vec<(SubscriptionHandle, Handler<T>)> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut panicked = 0;
        for (handle, handler) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(value))).is_err() {
                panicked += 1;
                error!(kind = self.kind, handle = handle.0, "Subscriber panicked");
            }
        }
        panicked
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
