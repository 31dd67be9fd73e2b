//! Persist plugins across several tabs sharing one storage backend.

mod common;

use common::init_tracing;
use serde_json::json;
use std::rc::Rc;
use tabsync_core::{
    MemoryStore, PersistHandle, PersistentStorage, Store, StorageHub, persist_all_factory,
    persist_factory,
};

const NAMESPACE: &str = "session";
const SET_LANGUAGE: &str = "session/SET_LANGUAGE";

fn open_tab(hub: &StorageHub) -> (Rc<MemoryStore>, PersistHandle) {
    let store = Rc::new(MemoryStore::new());
    let handle = persist_factory(Rc::new(hub.view()), NAMESPACE, &["SET_LANGUAGE"], true)(
        Rc::clone(&store),
    )
    .unwrap();
    (store, handle)
}

#[test]
fn test_round_trip_through_fresh_store() {
    init_tracing();
    let hub = StorageHub::new();

    let (first, handle) = open_tab(&hub);
    first.commit(SET_LANGUAGE, json!({"code": "es"})).unwrap();
    assert_eq!(
        hub.view().get(NAMESPACE, "SET_LANGUAGE"),
        Some(json!({"code": "es"}))
    );
    drop(handle);

    let (second, _handle) = open_tab(&hub);
    assert_eq!(second.commits_of(SET_LANGUAGE), vec![json!({"code": "es"})]);
}

#[test]
fn test_other_tabs_replay_without_echo() {
    init_tracing();
    let hub = StorageHub::new();
    let (a, _ha) = open_tab(&hub);
    let (b, _hb) = open_tab(&hub);
    let (c, _hc) = open_tab(&hub);

    a.commit(SET_LANGUAGE, json!("fr")).unwrap();

    assert_eq!(a.commits_of(SET_LANGUAGE), vec![json!("fr")]);
    assert_eq!(b.commits_of(SET_LANGUAGE), vec![json!("fr")]);
    assert_eq!(c.commits_of(SET_LANGUAGE), vec![json!("fr")]);

    // Re-committing an equal payload writes nothing, so nobody replays it.
    b.commit(SET_LANGUAGE, json!("fr")).unwrap();
    assert_eq!(a.commits_of(SET_LANGUAGE).len(), 1);
    assert_eq!(c.commits_of(SET_LANGUAGE).len(), 1);
}

#[test]
fn test_dropped_handle_stops_mirroring() {
    init_tracing();
    let hub = StorageHub::new();
    let (a, handle) = open_tab(&hub);
    let (b, _hb) = open_tab(&hub);
    drop(handle);

    a.commit(SET_LANGUAGE, json!("de")).unwrap();
    assert_eq!(hub.view().get(NAMESPACE, "SET_LANGUAGE"), None);
    assert!(b.commits_of(SET_LANGUAGE).is_empty());
}

#[test]
fn test_persist_all_across_tabs() {
    init_tracing();
    let hub = StorageHub::new();
    let open = || {
        let store = Rc::new(MemoryStore::new());
        let handle = persist_all_factory(Rc::new(hub.view()), "uploads", &["ADD_FILE"], true)(
            Rc::clone(&store),
        )
        .unwrap();
        (store, handle)
    };
    let (a, _ha) = open();
    let (b, _hb) = open();

    a.commit("uploads/ADD_FILE", json!({"id": 1})).unwrap();
    a.commit("uploads/ADD_FILE", json!({"id": 1})).unwrap();
    b.commit("uploads/ADD_FILE", json!({"id": 2})).unwrap();

    assert_eq!(
        hub.view().get("uploads", "ADD_FILE"),
        Some(json!([{"id": 1}, {"id": 2}]))
    );
    // Each tab sees each distinct file once from the other.
    assert_eq!(
        b.commits_of("uploads/ADD_FILE"),
        vec![json!({"id": 1}), json!({"id": 2})]
    );
    assert_eq!(
        a.commits_of("uploads/ADD_FILE"),
        vec![json!({"id": 1}), json!({"id": 1}), json!({"id": 2})]
    );

    let (fresh, _hf) = open();
    assert_eq!(
        fresh.commits_of("uploads/ADD_FILE"),
        vec![json!({"id": 1}), json!({"id": 2})]
    );
}

#[test]
fn test_replay_reaches_store_owned_by_handle() {
    init_tracing();
    let hub = StorageHub::new();
    let store = MemoryStore::new();
    // Only the plugin holds this Rc; `store` is a clone sharing its state.
    let _handle =
        persist_factory(Rc::new(hub.view()), "s", &["SET"], false)(Rc::new(store.clone())).unwrap();

    hub.view().set("s", "SET", json!("es")).unwrap();

    assert_eq!(store.commits_of("SET"), vec![json!("es")]);
}
