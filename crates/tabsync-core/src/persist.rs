//! Persist plugins: mirror store mutations into cross-tab storage.
//!
//! `persist_factory` keeps the latest payload of each mapped mutation under
//! `(namespace, mutation)`. `persist_all_factory` keeps every distinct payload
//! in an array instead. Both hydrate the store from storage on install and
//! replay writes made by other tabs. Deep equality against what is already
//! stored is what stops a replayed write from being written back.

use crate::events::Subscription;
use crate::storage::PersistentStorage;
use crate::store::{Mutation, Store};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Persist namespace is empty")]
    EmptyNamespace,

    #[error("No mutations to persist")]
    NoMutations,
}

/// Namespace plus the mapping from store mutation name to storage key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceMapping {
    pub namespace: String,
    keys: HashMap<String, String>,
}

impl PersistenceMapping {
    /// Map each of `mutations` to a storage key of the same name. With
    /// `prefix_mutations`, the store mutation is `"{namespace}/{mutation}"`.
    pub fn new(namespace: &str, mutations: &[&str], prefix_mutations: bool) -> Result<Self, PersistError> {
        if namespace.is_empty() {
            return Err(PersistError::EmptyNamespace);
        }
        if mutations.is_empty() {
            return Err(PersistError::NoMutations);
        }
        let keys = mutations
            .iter()
            .map(|m| {
                let name = if prefix_mutations {
                    format!("{namespace}/{m}")
                } else {
                    m.to_string()
                };
                (name, m.to_string())
            })
            .collect();
        Ok(Self {
            namespace: namespace.to_string(),
            keys,
        })
    }

    /// Storage key for a mutation, if it is mapped.
    pub fn storage_key(&self, mutation: &str) -> Option<&str> {
        self.keys.get(mutation).map(String::as_str)
    }

    /// `(mutation name, storage key)` pairs.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.keys.iter().map(|(m, k)| (m.as_str(), k.as_str()))
    }
}

/// Installed persist plugin. Keeps the store alive; dropping it stops
/// persisting and replaying.
pub struct PersistHandle {
    _store: Rc<dyn Any>,
    _mutations: Subscription,
    _watches: Vec<Subscription>,
}

/// How stored values relate to mutation payloads.
#[derive(Clone, Copy)]
enum Mode {
    /// Latest payload.
    Latest,
    /// Append-only array of distinct payloads.
    All,
}

/// Store plugin persisting the latest payload of each mapped mutation.
pub fn persist_factory<P, S>(
    storage: Rc<P>,
    namespace: &str,
    mutations: &[&str],
    prefix_mutations: bool,
) -> impl FnOnce(Rc<S>) -> Result<PersistHandle, PersistError>
where
    P: PersistentStorage + 'static,
    S: Store + 'static,
{
    let mapping = PersistenceMapping::new(namespace, mutations, prefix_mutations);
    move |store| install(storage, mapping?, store, Mode::Latest)
}

/// Store plugin persisting every distinct payload of each mapped mutation.
/// Hydration commits each stored payload in order.
pub fn persist_all_factory<P, S>(
    storage: Rc<P>,
    namespace: &str,
    mutations: &[&str],
    prefix_mutations: bool,
) -> impl FnOnce(Rc<S>) -> Result<PersistHandle, PersistError>
where
    P: PersistentStorage + 'static,
    S: Store + 'static,
{
    let mapping = PersistenceMapping::new(namespace, mutations, prefix_mutations);
    move |store| install(storage, mapping?, store, Mode::All)
}

fn install<P, S>(
    storage: Rc<P>,
    mapping: PersistenceMapping,
    store: Rc<S>,
    mode: Mode,
) -> Result<PersistHandle, PersistError>
where
    P: PersistentStorage + 'static,
    S: Store + 'static,
{
    let mapping = Rc::new(mapping);
    let namespace = mapping.namespace.as_str();

    let mut watches = Vec::new();
    for (mutation, key) in mapping.entries() {
        let weak: Weak<S> = Rc::downgrade(&store);
        let mutation_name = mutation.to_string();
        watches.push(storage.on_change(
            namespace,
            key,
            Box::new(move |new, old| {
                let Some(store) = weak.upgrade() else {
                    return;
                };
                replay(&*store, &mutation_name, new, old, mode);
            }),
        ));

        if let Some(stored) = storage.get(namespace, key) {
            debug!(namespace, key, "Hydrating from storage");
            replay(&*store, mutation, Some(&stored), None, mode);
        }
    }

    let subscription = {
        let storage = Rc::clone(&storage);
        let mapping = Rc::clone(&mapping);
        store.subscribe_mutations(Box::new(move |mutation| {
            persist(&*storage, &mapping, mutation, mode);
        }))
    };

    Ok(PersistHandle {
        _store: store,
        _mutations: subscription,
        _watches: watches,
    })
}

/// Commit values that arrived through storage.
fn replay<S: Store + ?Sized>(store: &S, mutation: &str, new: Option<&Value>, old: Option<&Value>, mode: Mode) {
    let Some(new) = new else {
        return;
    };
    if Some(new) == old {
        return;
    }
    let payloads: Vec<&Value> = match mode {
        Mode::Latest => vec![new],
        Mode::All => {
            let previous = old.and_then(Value::as_array);
            as_entries(new)
                .iter()
                .filter(|v| !previous.is_some_and(|p| p.contains(*v)))
                .collect()
        }
    };
    for payload in payloads {
        if let Err(e) = store.commit(mutation, payload.clone()) {
            error!(mutation, "Failed to replay persisted value: {}", e);
        }
    }
}

/// Write a committed payload through to storage if it changes anything.
fn persist<P: PersistentStorage + ?Sized>(
    storage: &P,
    mapping: &PersistenceMapping,
    mutation: &Mutation,
    mode: Mode,
) {
    let Some(key) = mapping.storage_key(&mutation.mutation_type) else {
        return;
    };
    let namespace = mapping.namespace.as_str();
    let stored = storage.get(namespace, key);

    let value = match mode {
        Mode::Latest => {
            if stored.as_ref() == Some(&mutation.payload) {
                return;
            }
            mutation.payload.clone()
        }
        Mode::All => {
            let mut entries = stored.as_ref().map(as_entries).unwrap_or_default().to_vec();
            if entries.contains(&mutation.payload) {
                return;
            }
            entries.push(mutation.payload.clone());
            Value::Array(entries)
        }
    };

    if let Err(e) = storage.set(namespace, key, value) {
        error!(namespace, key, "Failed to persist mutation: {}", e);
    }
}

fn as_entries(value: &Value) -> &[Value] {
    match value {
        Value::Array(entries) => entries,
        other => {
            warn!(value = %other, "Expected an array of persisted values");
            &[]
        }
    }
}
