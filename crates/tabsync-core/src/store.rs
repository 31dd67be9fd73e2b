//! Application state store seam.
//!
//! The router and the persist plugins only ever talk to a store through
//! [`Store`]: they commit mutations, dispatch actions and watch the stream of
//! committed mutations.
//!
//! Implementations:
//! - `MemoryStore` - records every commit/dispatch, for tests and headless use
//! - `JsStore` (in tabsync-wasm) - forwards to the host application's store

use crate::events::Subscription;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::{Rc, Weak};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Unknown mutation: {0}")]
    UnknownMutation(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Handler failed: {0}")]
    Handler(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A committed mutation as seen by mutation subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    #[serde(rename = "type")]
    pub mutation_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl Mutation {
    pub fn new(mutation_type: impl Into<String>, payload: Value) -> Self {
        Self {
            mutation_type: mutation_type.into(),
            payload,
        }
    }
}

pub type MutationCallback = Box<dyn Fn(&Mutation)>;

pub trait Store {
    /// Apply a synchronous mutation. Successful commits are reported to
    /// every mutation subscriber.
    fn commit(&self, name: &str, payload: Value) -> Result<()>;

    /// Start an action.
    fn dispatch(&self, name: &str, payload: Value) -> Result<()>;

    /// Observe every committed mutation until the returned handle drops.
    fn subscribe_mutations(&self, callback: MutationCallback) -> Subscription;
}

type Subscriber = Rc<dyn Fn(&Mutation)>;

#[derive(Default)]
struct StoreState {
    mutations: Option<HashSet<String>>,
    actions: Option<HashSet<String>>,
    commits: Vec<Mutation>,
    dispatches: Vec<Mutation>,
    subscribers: Vec<(usize, Subscriber)>,
}

/// Store that records what it receives.
///
/// Accepts any mutation or action name unless restricted with
/// [`MemoryStore::with_mutations`] / [`MemoryStore::with_actions`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Rc<RefCell<StoreState>>,
    next_id: Rc<Cell<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept commits of these mutation names.
    pub fn with_mutations<I, N>(self, names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        self.state.borrow_mut().mutations = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Only accept dispatches of these action names.
    pub fn with_actions<I, N>(self, names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        self.state.borrow_mut().actions = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Every commit so far, in order.
    pub fn commits(&self) -> Vec<Mutation> {
        self.state.borrow().commits.clone()
    }

    /// Commits of one mutation name.
    pub fn commits_of(&self, name: &str) -> Vec<Value> {
        self.state
            .borrow()
            .commits
            .iter()
            .filter(|m| m.mutation_type == name)
            .map(|m| m.payload.clone())
            .collect()
    }

    /// Every dispatch so far, in order.
    pub fn dispatches(&self) -> Vec<Mutation> {
        self.state.borrow().dispatches.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.borrow().subscribers.len()
    }
}

impl Store for MemoryStore {
    fn commit(&self, name: &str, payload: Value) -> Result<()> {
        let mutation = Mutation::new(name, payload);
        let subscribers: Vec<Subscriber> = {
            let mut state = self.state.borrow_mut();
            if let Some(known) = &state.mutations {
                if !known.contains(name) {
                    return Err(StoreError::UnknownMutation(name.to_string()));
                }
            }
            state.commits.push(mutation.clone());
            state.subscribers.iter().map(|(_, s)| Rc::clone(s)).collect()
        };
        // Borrow released: subscribers may commit again.
        for subscriber in subscribers {
            subscriber(&mutation);
        }
        Ok(())
    }

    fn dispatch(&self, name: &str, payload: Value) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if let Some(known) = &state.actions {
            if !known.contains(name) {
                return Err(StoreError::UnknownAction(name.to_string()));
            }
        }
        state.dispatches.push(Mutation::new(name, payload));
        Ok(())
    }

    fn subscribe_mutations(&self, callback: MutationCallback) -> Subscription {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.state
            .borrow_mut()
            .subscribers
            .push((id, Rc::from(callback)));

        let state: Weak<RefCell<StoreState>> = Rc::downgrade(&self.state);
        Subscription::new(move || {
            if let Some(state) = state.upgrade() {
                if let Ok(mut state) = state.try_borrow_mut() {
                    state.subscribers.retain(|(i, _)| *i != id);
                }
            }
        })
    }
}
