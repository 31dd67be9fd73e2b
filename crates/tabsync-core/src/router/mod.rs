//! Change router: database change feed → store.
//!
//! One router per database connection. It subscribes to the database's
//! batched change feed, drops changes this process wrote itself, rebuilds a
//! full object for the rest and emits it on an [`EventBus`] under
//! `"{table}/{changeType}"`, where bound [`Listener`]s turn it into store
//! commits and dispatches.
//!
//! ```ignore
//! let plugin = change_router_plugin(db, vec![
//!     commit_listener("ADD_CONTENTNODE").bind("contentnode", ChangeType::Created, Some("contentNode"))?,
//!     commit_listener("REMOVE_CONTENTNODE").bind("contentnode", ChangeType::Deleted, Some("contentNode"))?,
//! ]);
//! let _router = plugin(store)?;
//! ```

mod listener;

pub use listener::{Listener, ListenerBinding, commit_listener, dispatch_listener};

use crate::change::{ChangeRecord, ChangeType, ChangeTypeError, JsonObject};
use crate::database::{ChangeDatabase, KeyPath};
use crate::events::{EventBus, Subscription};
use crate::store::Store;
use serde_json::Value;
use std::any::Any;
use std::convert::Infallible;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Listener bound without a table name")]
    EmptyTableName,

    #[error("Listener bound with an empty namespace prefix")]
    EmptyNamespace,

    #[error("Listener group has no members")]
    EmptyGroup,

    #[error(transparent)]
    InvalidChangeType(#[from] ChangeTypeError),

    #[error("Listener registered before being bound")]
    Unbound,
}

impl From<Infallible> for RouterError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

/// Bus key for a `(table, change type)` pair: `"{table}/{code}"`.
pub fn event_key(table: &str, change_type: ChangeType) -> String {
    format!("{}/{}", table, change_type.code())
}

/// Routes one database's changes onto an event bus.
pub struct ChangeRouter<D> {
    db: Rc<D>,
    bus: Rc<EventBus>,
}

impl<D: ChangeDatabase> ChangeRouter<D> {
    pub fn new(db: Rc<D>) -> Self {
        Self {
            db,
            bus: Rc::new(EventBus::new()),
        }
    }

    pub fn bus(&self) -> &Rc<EventBus> {
        &self.bus
    }

    /// Emit every change in `changes` not written by this process.
    /// Returns how many were emitted.
    pub fn route(&self, changes: &[ChangeRecord]) -> usize {
        route_changes(&*self.db, &self.bus, changes)
    }
}

/// Emit each foreign change in `changes` on `bus`, in order.
pub fn route_changes<D: ChangeDatabase + ?Sized>(db: &D, bus: &EventBus, changes: &[ChangeRecord]) -> usize {
    let client_id = db.client_id();
    let mut emitted = 0;
    for change in changes {
        if client_id.is_source_of(change.source.as_deref()) {
            trace!(table = %change.table, key = %change.key, "Skipping self-originated change");
            continue;
        }
        let obj = full_object(change, db.primary_key(&change.table).as_ref());
        let key = event_key(&change.table, change.change_type);
        let delivered = bus.emit(&key, &Value::Object(obj));
        debug!(event = %key, key = %change.key, delivered, "Routed change");
        emitted += 1;
    }
    emitted
}

/// The changed entity as the store sees it: the record's payload plus its
/// primary key fields.
///
/// The payload is `obj`, else `mods` for an update carrying no `obj`, else empty.
pub fn full_object(change: &ChangeRecord, key_path: Option<&KeyPath>) -> JsonObject {
    let mut obj = match (&change.obj, &change.mods, change.change_type) {
        (Some(obj), _, _) => obj.clone(),
        (None, Some(mods), ChangeType::Updated) => mods.clone(),
        _ => JsonObject::new(),
    };
    match key_path {
        Some(path) => {
            if !path.inject(&mut obj, &change.key) {
                warn!(table = %change.table, key = %change.key, "Key doesn't match compound primary key");
            }
        }
        None => debug!(table = %change.table, "No primary key known for table"),
    }
    obj
}

/// Live router installed on a store. Keeps the store alive; dropping it
/// unsubscribes everything.
pub struct RouterHandle {
    bus: Rc<EventBus>,
    _store: Rc<dyn Any>,
    _feed: Subscription,
    _listeners: Vec<Subscription>,
}

impl RouterHandle {
    pub fn bus(&self) -> &Rc<EventBus> {
        &self.bus
    }
}

/// Store plugin wiring `db`'s change feed to `listeners`.
///
/// All listeners are registered before the feed is connected; a listener
/// that isn't bound fails the whole plugin.
pub fn change_router_plugin<D, S>(
    db: Rc<D>,
    listeners: Vec<Listener<S>>,
) -> impl FnOnce(Rc<S>) -> Result<RouterHandle, RouterError>
where
    D: ChangeDatabase + 'static,
    S: Store + 'static,
{
    move |store| {
        let router = ChangeRouter::new(db);
        let mut subscriptions = Vec::new();
        for listener in &listeners {
            subscriptions.extend(listener.register(router.bus(), &store)?);
        }

        let bus = Rc::clone(router.bus());
        let db = Rc::clone(&router.db);
        let feed = db.on_changes(Box::new(move |changes| {
            router.route(changes);
        }));
        debug!(listeners = subscriptions.len(), "Change router installed");

        Ok(RouterHandle {
            bus,
            _store: store,
            _feed: feed,
            _listeners: subscriptions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_id::ClientId;
    use crate::database::InMemoryDatabase;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn object(value: Value) -> JsonObject {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn database() -> Rc<InMemoryDatabase> {
        Rc::new(
            InMemoryDatabase::new(ClientId::from(1))
                .with_table("contentnode", KeyPath::single("id"))
                .with_table("prerequisite", KeyPath::compound(["target", "prerequisite"])),
        )
    }

    #[test]
    fn test_event_key() {
        assert_eq!(event_key("contentnode", ChangeType::Deleted), "contentnode/3");
    }

    #[test]
    fn test_full_object_adds_key_fields() {
        let change = ChangeRecord::updated(
            "contentnode",
            "n1",
            None,
            object(json!({"title": "t"})),
            None,
        );
        let obj = full_object(&change, Some(&KeyPath::single("id")));
        assert_eq!(Value::Object(obj), json!({"id": "n1", "title": "t"}));

        let change = ChangeRecord::deleted("prerequisite", json!(["a", "b"]), None);
        let obj = full_object(&change, Some(&KeyPath::compound(["target", "prerequisite"])));
        assert_eq!(Value::Object(obj), json!({"target": "a", "prerequisite": "b"}));
    }

    #[test]
    fn test_full_object_prefers_obj() {
        let change = ChangeRecord::updated(
            "contentnode",
            "n1",
            None,
            object(json!({"title": "t"})),
            Some(object(json!({"id": "n1", "title": "t", "kind": "topic"}))),
        );
        let obj = full_object(&change, None);
        assert_eq!(obj["kind"], json!("topic"));
    }

    #[test]
    fn test_route_skips_own_changes() {
        let db = database();
        let router = ChangeRouter::new(Rc::clone(&db));
        let changes = vec![
            ChangeRecord::created("contentnode", "mine", JsonObject::new())
                .with_source(db.client_id().to_string()),
            ChangeRecord::created("contentnode", "theirs", JsonObject::new())
                .with_source("00000000000000aa"),
            ChangeRecord::created("contentnode", "server", JsonObject::new()),
        ];
        assert_eq!(router.route(&changes), 2);
    }

    #[test]
    fn test_plugin_routes_remote_writes() {
        let db = database();
        let store = Rc::new(MemoryStore::new());
        let plugin = change_router_plugin(
            Rc::clone(&db),
            vec![
                commit_listener::<MemoryStore>("ADD_CONTENTNODE")
                    .bind("contentnode", ChangeType::Created, Some("contentNode"))
                    .unwrap(),
                commit_listener::<MemoryStore>("REMOVE_PREREQUISITE")
                    .bind("prerequisite", ChangeType::Deleted, None)
                    .unwrap(),
            ],
        );
        let _router = plugin(Rc::clone(&store)).unwrap();

        // Local write: never routed back into this store.
        db.put("contentnode", object(json!({"id": "local"}))).unwrap();
        assert!(store.commits().is_empty());

        db.apply_remote(vec![
            ChangeRecord::created("contentnode", "remote", object(json!({"title": "r"})))
                .with_source("00000000000000aa"),
            ChangeRecord::deleted("prerequisite", json!(["x", "y"]), None)
                .with_source("00000000000000aa"),
        ]);

        assert_eq!(
            store.commits_of("contentNode/ADD_CONTENTNODE"),
            vec![json!({"id": "remote", "title": "r"})]
        );
        assert_eq!(
            store.commits_of("REMOVE_PREREQUISITE"),
            vec![json!({"target": "x", "prerequisite": "y"})]
        );
    }

    #[test]
    fn test_plugin_rejects_unbound_listener() {
        let plugin = change_router_plugin(database(), vec![commit_listener::<MemoryStore>("ADD")]);
        assert!(matches!(
            plugin(Rc::new(MemoryStore::new())),
            Err(RouterError::Unbound)
        ));
    }

    #[test]
    fn test_dropping_handle_stops_routing() {
        let db = database();
        let store = Rc::new(MemoryStore::new());
        let plugin = change_router_plugin(
            Rc::clone(&db),
            vec![
                commit_listener::<MemoryStore>("ADD")
                    .bind("contentnode", ChangeType::Created, None)
                    .unwrap(),
            ],
        );
        let router = plugin(Rc::clone(&store)).unwrap();
        assert_eq!(router.bus().listener_count("contentnode/1"), 1);
        drop(router);

        db.apply_remote(vec![ChangeRecord::created("contentnode", "r", JsonObject::new())]);
        assert!(store.commits().is_empty());
    }
}
