//! Listeners: what a bound `(table, change type)` event does to the store.
//!
//! A [`Listener`] is either a single action or a group of actions bound
//! together. Binding validates its arguments up front; registration turns
//! each action into one event-bus handler, so a failing action never stops
//! its siblings.

use super::{RouterError, event_key};
use crate::change::ChangeType;
use crate::events::{EventBus, HandlerError, Subscription};
use crate::store::{Store, StoreError};
use serde_json::Value;
use std::rc::{Rc, Weak};
use tracing::trace;

type Callback<S> = Rc<dyn Fn(&S, Value) -> Result<(), StoreError>>;

/// What to do with a routed object.
enum Action<S> {
    /// `store.commit(prefixed name, obj)`
    Commit(String),
    /// `store.dispatch(prefixed name, obj)`
    Dispatch(String),
    Callback(Callback<S>),
}

impl<S> Clone for Action<S> {
    fn clone(&self) -> Self {
        match self {
            Action::Commit(name) => Action::Commit(name.clone()),
            Action::Dispatch(name) => Action::Dispatch(name.clone()),
            Action::Callback(f) => Action::Callback(Rc::clone(f)),
        }
    }
}

impl<S: Store> Action<S> {
    fn run(&self, store: &S, binding: &ListenerBinding, obj: Value) -> Result<(), StoreError> {
        match self {
            Action::Commit(name) => store.commit(&binding.prefix(name), obj),
            Action::Dispatch(name) => store.dispatch(&binding.prefix(name), obj),
            Action::Callback(f) => f(store, obj),
        }
    }
}

enum Kind<S> {
    Single(Action<S>),
    Group(Vec<Action<S>>),
}

/// Where a listener is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerBinding {
    pub table_name: String,
    pub change_type: ChangeType,
    pub namespace_prefix: Option<String>,
}

impl ListenerBinding {
    /// `"{namespace}/{name}"`, or `name` when unnamespaced.
    pub fn prefix(&self, name: &str) -> String {
        match &self.namespace_prefix {
            Some(namespace) => format!("{namespace}/{name}"),
            None => name.to_string(),
        }
    }

    pub fn event_key(&self) -> String {
        event_key(&self.table_name, self.change_type)
    }
}

/// A single listener or a listener group, optionally bound.
pub struct Listener<S> {
    kind: Kind<S>,
    binding: Option<ListenerBinding>,
}

impl<S: Store + 'static> Listener<S> {
    /// Listener running an arbitrary callback with the routed object.
    pub fn new(callback: impl Fn(&S, Value) -> Result<(), StoreError> + 'static) -> Self {
        Self::single(Action::Callback(Rc::new(callback)))
    }

    /// Several listeners bound and registered together. Bindings of the
    /// members are ignored; the group's own binding applies to all.
    pub fn group(listeners: impl IntoIterator<Item = Listener<S>>) -> Self {
        let actions = listeners
            .into_iter()
            .flat_map(|listener| match listener.kind {
                Kind::Single(action) => vec![action],
                Kind::Group(actions) => actions,
            })
            .collect();
        Self {
            kind: Kind::Group(actions),
            binding: None,
        }
    }

    fn single(action: Action<S>) -> Self {
        Self {
            kind: Kind::Single(action),
            binding: None,
        }
    }

    /// Attach to `(table_name, change_type)`, optionally addressing a store
    /// namespace. `change_type` may be a [`ChangeType`], its integer code or
    /// its name.
    pub fn bind<C>(
        mut self,
        table_name: &str,
        change_type: C,
        namespace_prefix: Option<&str>,
    ) -> Result<Self, RouterError>
    where
        C: TryInto<ChangeType>,
        RouterError: From<C::Error>,
    {
        let change_type = change_type.try_into()?;
        if table_name.is_empty() {
            return Err(RouterError::EmptyTableName);
        }
        if namespace_prefix.is_some_and(str::is_empty) {
            return Err(RouterError::EmptyNamespace);
        }
        if let Kind::Group(actions) = &self.kind {
            if actions.is_empty() {
                return Err(RouterError::EmptyGroup);
            }
        }
        self.binding = Some(ListenerBinding {
            table_name: table_name.to_string(),
            change_type,
            namespace_prefix: namespace_prefix.map(str::to_string),
        });
        Ok(self)
    }

    pub fn binding(&self) -> Option<&ListenerBinding> {
        self.binding.as_ref()
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, Kind::Group(_))
    }

    /// Subscribe this listener's actions on `bus`. The handlers only hold the
    /// store weakly; whoever installs them keeps it alive.
    pub fn register(&self, bus: &Rc<EventBus>, store: &Rc<S>) -> Result<Vec<Subscription>, RouterError> {
        let binding = self.binding.clone().ok_or(RouterError::Unbound)?;
        let actions: Vec<Action<S>> = match &self.kind {
            Kind::Single(action) => vec![action.clone()],
            Kind::Group(actions) => actions.clone(),
        };

        let key = binding.event_key();
        let binding = Rc::new(binding);
        let subscriptions = actions
            .into_iter()
            .map(|action| {
                let store: Weak<S> = Rc::downgrade(store);
                let binding = Rc::clone(&binding);
                bus.subscribe(key.clone(), move |obj: &Value| {
                    let Some(store) = store.upgrade() else {
                        trace!("Store dropped, ignoring routed change");
                        return Ok(());
                    };
                    action
                        .run(&store, &binding, obj.clone())
                        .map_err(|e| HandlerError(e.to_string()))
                })
            })
            .collect();
        Ok(subscriptions)
    }
}

/// Listener committing the routed object as mutation `name`.
pub fn commit_listener<S: Store + 'static>(name: &str) -> Listener<S> {
    Listener::single(Action::Commit(name.to_string()))
}

/// Listener dispatching the routed object as action `name`.
pub fn dispatch_listener<S: Store + 'static>(name: &str) -> Listener<S> {
    Listener::single(Action::Dispatch(name.to_string()))
}
