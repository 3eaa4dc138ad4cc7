#![forbid(unsafe_code)]

//! Explicit subscriber lists.
//!
//! Every observable value owns its [`Event`]s; there is no global dispatcher.
//! Tearing an owner down is a single [`Event::clear`] per list.

use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Handle returned by [`Event::subscribe`], used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

pub struct Event<T> {
    handlers: Mutex<Vec<(SubscriptionId, Handler<T>)>>,
    next_id: AtomicU64,
}

impl<T> Event<T> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().push((id, Arc::new(handler)));
        id
    }

    /// Returns `false` if the subscription was not (or no longer) registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(sid, _)| *sid != id);
        handlers.len() != before
    }

    pub fn has_subscribers(&self) -> bool {
        !self.handlers.lock().is_empty()
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn clear(&self) {
        self.handlers.lock().clear();
    }

    /// Invoke every handler in subscription order.
    ///
    /// Handlers run outside the lock, so they may subscribe or unsubscribe
    /// (themselves included) without deadlocking. A panicking handler is
    /// logged and the remaining handlers still run.
    pub(crate) fn emit(&self, value: &T) {
        let handlers: Vec<(SubscriptionId, Handler<T>)> = self
            .handlers
            .lock()
            .iter()
            .map(|(id, handler)| (*id, Arc::clone(handler)))
            .collect();
        for (id, handler) in handlers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(value))) {
                warn!(subscription = id.0, panic = panic_message(&*payload), "event handler panicked");
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
