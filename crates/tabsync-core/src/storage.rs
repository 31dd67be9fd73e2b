//! Cross-tab persistent storage seam.
//!
//! Values are JSON, addressed by `(namespace, key)`. A write made through one
//! view is reported to `on_change` watchers of every *other* view sharing the
//! same backing store, mirroring the browser `storage` event.
//!
//! Implementations:
//! - `InMemoryStorage` - views over a shared `StorageHub`
//! - `JsStorage` (in tabsync-wasm) - wraps `localStorage` and the `storage` event

use crate::events::Subscription;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Called with `(new_value, old_value)`; `None` means absent.
pub type ChangeCallback = Box<dyn Fn(Option<&Value>, Option<&Value>)>;

pub trait PersistentStorage {
    fn get(&self, namespace: &str, key: &str) -> Option<Value>;

    fn set(&self, namespace: &str, key: &str, value: Value) -> Result<()>;

    /// Watch writes to one key made by other views.
    fn on_change(&self, namespace: &str, key: &str, callback: ChangeCallback) -> Subscription;
}

type Watcher = Rc<dyn Fn(Option<&Value>, Option<&Value>)>;

struct WatchEntry {
    id: usize,
    view: usize,
    slot: (String, String),
    callback: Watcher,
}

#[derive(Default)]
struct HubState {
    next_id: usize,
    values: HashMap<(String, String), Value>,
    /// Serialized size of each value, for quota accounting.
    sizes: HashMap<(String, String), usize>,
    quota: Option<usize>,
    watchers: Vec<WatchEntry>,
}

impl HubState {
    fn next_id(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// Backing store shared by several [`InMemoryStorage`] views (one per tab).
#[derive(Clone, Default)]
pub struct StorageHub {
    state: Rc<RefCell<HubState>>,
}

impl StorageHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a view. Each view stands for one browser context.
    pub fn view(&self) -> InMemoryStorage {
        let id = self.state.borrow_mut().next_id();
        InMemoryStorage {
            id,
            hub: self.clone(),
        }
    }

    /// Limit the total serialized size of all stored values.
    pub fn set_quota(&self, bytes: Option<usize>) {
        self.state.borrow_mut().quota = bytes;
    }

    pub fn used_bytes(&self) -> usize {
        self.state.borrow().sizes.values().sum()
    }
}

/// One context's view of a [`StorageHub`].
#[derive(Clone)]
pub struct InMemoryStorage {
    id: usize,
    hub: StorageHub,
}

impl PersistentStorage for InMemoryStorage {
    fn get(&self, namespace: &str, key: &str) -> Option<Value> {
        self.hub
            .state
            .borrow()
            .values
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
    }

    fn set(&self, namespace: &str, key: &str, value: Value) -> Result<()> {
        let slot = (namespace.to_string(), key.to_string());
        let size = serde_json::to_string(&value)?.len();

        let (old, watchers) = {
            let mut state = self.hub.state.borrow_mut();
            if let Some(quota) = state.quota {
                let others: usize = state
                    .sizes
                    .iter()
                    .filter(|(k, _)| **k != slot)
                    .map(|(_, s)| *s)
                    .sum();
                if others + size > quota {
                    return Err(StorageError::QuotaExceeded(format!(
                        "{} bytes needed, {} available",
                        others + size,
                        quota
                    )));
                }
            }
            state.sizes.insert(slot.clone(), size);
            let old = state.values.insert(slot.clone(), value.clone());
            let watchers: Vec<Watcher> = state
                .watchers
                .iter()
                .filter(|w| w.view != self.id && w.slot == slot)
                .map(|w| Rc::clone(&w.callback))
                .collect();
            (old, watchers)
        };

        trace!(namespace, key, watchers = watchers.len(), "Storage write");
        for watcher in watchers {
            watcher(Some(&value), old.as_ref());
        }
        Ok(())
    }

    fn on_change(&self, namespace: &str, key: &str, callback: ChangeCallback) -> Subscription {
        let id = {
            let mut state = self.hub.state.borrow_mut();
            let id = state.next_id();
            state.watchers.push(WatchEntry {
                id,
                view: self.id,
                slot: (namespace.to_string(), key.to_string()),
                callback: Rc::from(callback),
            });
            id
        };

        let state: Weak<RefCell<HubState>> = Rc::downgrade(&self.hub.state);
        Subscription::new(move || {
            if let Some(state) = state.upgrade() {
                if let Ok(mut state) = state.try_borrow_mut() {
                    state.watchers.retain(|w| w.id != id);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    type Seen = Rc<RefCell<Vec<(Option<Value>, Option<Value>)>>>;

    fn watch(storage: &InMemoryStorage, namespace: &str, key: &str) -> (Seen, Subscription) {
        let seen: Seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = Rc::clone(&seen);
        let sub = storage.on_change(
            namespace,
            key,
            Box::new(move |new, old| {
                seen_clone
                    .borrow_mut()
                    .push((new.cloned(), old.cloned()));
            }),
        );
        (seen, sub)
    }

    #[test]
    fn test_views_share_values() {
        let hub = StorageHub::new();
        let a = hub.view();
        let b = hub.view();

        a.set("session", "language", json!("en")).unwrap();
        assert_eq!(b.get("session", "language"), Some(json!("en")));
        assert_eq!(b.get("other", "language"), None);
    }

    #[test]
    fn test_change_reaches_other_views_only() {
        let hub = StorageHub::new();
        let a = hub.view();
        let b = hub.view();
        let (seen_a, _sub_a) = watch(&a, "session", "language");
        let (seen_b, _sub_b) = watch(&b, "session", "language");

        a.set("session", "language", json!("en")).unwrap();
        a.set("session", "language", json!("fr")).unwrap();

        assert!(seen_a.borrow().is_empty());
        assert_eq!(
            *seen_b.borrow(),
            vec![
                (Some(json!("en")), None),
                (Some(json!("fr")), Some(json!("en"))),
            ]
        );
    }

    #[test]
    fn test_watchers_filter_by_slot() {
        let hub = StorageHub::new();
        let a = hub.view();
        let b = hub.view();
        let (seen, _sub) = watch(&b, "session", "language");

        a.set("session", "theme", json!("dark")).unwrap();
        a.set("other", "language", json!("en")).unwrap();

        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn test_quota_exceeded() {
        let hub = StorageHub::new();
        let a = hub.view();
        hub.set_quota(Some(10));

        a.set("ns", "small", json!("abc")).unwrap();
        let err = a.set("ns", "big", json!("0123456789")).unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded(_)));
        assert_eq!(
            err.to_string(),
            "Storage quota exceeded: 17 bytes needed, 10 available"
        );
        assert_eq!(a.get("ns", "big"), None);

        // Overwriting counts only the new size.
        a.set("ns", "small", json!("abcdefgh")).unwrap();
        assert_eq!(hub.used_bytes(), 10);
    }

    #[test]
    fn test_dropped_watch_stops_notifications() {
        let hub = StorageHub::new();
        let a = hub.view();
        let b = hub.view();
        let (seen, sub) = watch(&b, "ns", "k");
        drop(sub);

        a.set("ns", "k", json!(1)).unwrap();
        assert!(seen.borrow().is_empty());
    }
}
