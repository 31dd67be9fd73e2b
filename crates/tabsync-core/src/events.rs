//! Event infrastructure for tabsync-core.
//!
//! Provides `Subscription` (a disposer handle shared by every callback-based
//! seam in this crate) and `EventBus`, the keyed bus the change router emits
//! `"{table}/{changeType}"` events on.
//!
//! Everything here is single-threaded (`Rc` + `RefCell`): each browser context
//! runs its own cooperative event loop and nothing crosses threads.

use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use thiserror::Error;
use tracing::error;

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or call [`Subscription::dispose`]) to unsubscribe.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    disposer: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    /// Wrap a disposer closure that performs the unsubscribe.
    pub fn new(disposer: impl FnOnce() + 'static) -> Self {
        Self {
            disposer: Some(Box::new(disposer)),
        }
    }

    /// A subscription with nothing to undo.
    pub fn noop() -> Self {
        Self { disposer: None }
    }

    /// Unsubscribe now. Safe to call more than once.
    pub fn dispose(&mut self) {
        if let Some(disposer) = self.disposer.take() {
            disposer();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.disposer.is_some())
            .finish()
    }
}

/// Error returned by an event handler. The bus logs it and moves on.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

type Handler = Rc<dyn Fn(&Value) -> Result<(), HandlerError>>;

/// Keyed event bus.
///
/// Wrap in `Rc` to enable subscriptions. Each handler is isolated: an error or
/// a panic in one handler is logged and never prevents delivery to the
/// remaining handlers for the same key.
pub struct EventBus {
    handlers: RefCell<HashMap<String, Vec<(usize, Handler)>>>,
    next_id: Cell<usize>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            handlers: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events emitted under `key`. Returns `Subscription` that
    /// unsubscribes on drop.
    pub fn subscribe(
        self: &Rc<Self>,
        key: impl Into<String>,
        handler: impl Fn(&Value) -> Result<(), HandlerError> + 'static,
    ) -> Subscription {
        let key = key.into();
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.handlers
            .borrow_mut()
            .entry(key.clone())
            .or_default()
            .push((id, Rc::new(handler)));

        let bus: Weak<EventBus> = Rc::downgrade(self);
        Subscription::new(move || {
            if let Some(bus) = bus.upgrade() {
                bus.unsubscribe(&key, id);
            }
        })
    }

    fn unsubscribe(&self, key: &str, id: usize) {
        // try_borrow_mut: a handler may drop its own subscription mid-emit.
        if let Ok(mut handlers) = self.handlers.try_borrow_mut() {
            if let Some(list) = handlers.get_mut(key) {
                list.retain(|(i, _)| *i != id);
                if list.is_empty() {
                    handlers.remove(key);
                }
            }
        }
    }

    /// Number of handlers currently subscribed under `key`.
    pub fn listener_count(&self, key: &str) -> usize {
        self.handlers.borrow().get(key).map_or(0, Vec::len)
    }

    /// Emit `payload` to every handler subscribed under `key`.
    ///
    /// Returns how many handlers completed without error.
    pub fn emit(&self, key: &str, payload: &Value) -> usize {
        // Clone the handler list so a handler may subscribe without a borrow panic.
        let handlers: Vec<Handler> = self
            .handlers
            .borrow()
            .get(key)
            .map(|list| list.iter().map(|(_, h)| Rc::clone(h)).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for handler in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => error!(event = key, "Listener failed: {}", e),
                Err(_) => error!(event = key, "Listener panicked"),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn counter() -> (Rc<Cell<usize>>, Rc<Cell<usize>>) {
        let count = Rc::new(Cell::new(0));
        (Rc::clone(&count), count)
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Rc::new(EventBus::new());
        let (count, count_clone) = counter();

        let _sub = bus.subscribe("contentnode/2", move |_| {
            count_clone.set(count_clone.get() + 1);
            Ok(())
        });

        assert_eq!(bus.emit("contentnode/2", &json!({"id": "a"})), 1);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_emit_only_reaches_matching_key() {
        let bus = Rc::new(EventBus::new());
        let (count, count_clone) = counter();

        let _sub = bus.subscribe("contentnode/1", move |_| {
            count_clone.set(count_clone.get() + 1);
            Ok(())
        });

        bus.emit("contentnode/2", &json!({}));
        bus.emit("channel/1", &json!({}));
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Rc::new(EventBus::new());
        let (count, count_clone) = counter();

        {
            let _sub = bus.subscribe("t/1", move |_| {
                count_clone.set(count_clone.get() + 1);
                Ok(())
            });
            bus.emit("t/1", &json!({}));
            assert_eq!(count.get(), 1);
        }

        bus.emit("t/1", &json!({}));
        assert_eq!(count.get(), 1);
        assert_eq!(bus.listener_count("t/1"), 0);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let bus = Rc::new(EventBus::new());
        let mut sub = bus.subscribe("t/1", |_| Ok(()));
        assert_eq!(bus.listener_count("t/1"), 1);
        sub.dispose();
        sub.dispose();
        assert_eq!(bus.listener_count("t/1"), 0);
    }

    #[test]
    fn test_failing_handler_does_not_block_siblings() {
        let bus = Rc::new(EventBus::new());
        let (count, count_clone) = counter();

        let _failing = bus.subscribe("t/2", |_| Err(HandlerError("boom".into())));
        let _panicking = bus.subscribe("t/2", |_| panic!("listener bug"));
        let _ok = bus.subscribe("t/2", move |_| {
            count_clone.set(count_clone.get() + 1);
            Ok(())
        });

        assert_eq!(bus.emit("t/2", &json!({})), 1);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_subscription_outliving_bus() {
        let bus = Rc::new(EventBus::new());
        let sub = bus.subscribe("t/3", |_| Ok(()));
        drop(bus);
        drop(sub);
    }
}
