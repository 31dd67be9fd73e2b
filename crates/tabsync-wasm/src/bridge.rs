//! JavaScript bridges for WASM.
//!
//! Implements the core's collaborator traits (`BroadcastChannel`, `Timer`,
//! `Store`, `PersistentStorage`, `ChangeDatabase`) by calling JavaScript
//! callback functions supplied by the host page.

use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;
use tabsync_core::channel::{self, BroadcastChannel, DEFAULT_RESPONSE_TIME, TransportError};
use tabsync_core::database::{ChangeDatabase, ChangesCallback, KeyPath};
use tabsync_core::storage::{self, ChangeCallback, PersistentStorage, StorageError};
use tabsync_core::store::{self, Mutation, MutationCallback, Store, StoreError};
use tabsync_core::{ChangeRecord, ClientId, ClientIdError, ElectionMessage, Subscription, Timer};
use thiserror::Error;
use tracing::{error, warn};
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::JsFuture;

#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(js_name = setTimeout)]
    fn set_timeout(handler: &js_sys::Function, timeout: i32) -> JsValue;
}

/// Errors constructing bridges from host-supplied values.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Invalid client ID: {0}")]
    ClientId(#[from] ClientIdError),

    #[error("Invalid {what}: {source}")]
    Decode {
        what: &'static str,
        source: serde_wasm_bindgen::Error,
    },
}

/// Deserialize a host value, naming what it was meant to be on failure.
pub(crate) fn decode<T: serde::de::DeserializeOwned>(
    what: &'static str,
    value: JsValue,
) -> Result<T, BridgeError> {
    serde_wasm_bindgen::from_value(value).map_err(|source| BridgeError::Decode { what, source })
}

/// Best-effort message out of a thrown JS value.
pub(crate) fn js_error_message(err: &JsValue) -> String {
    err.as_string()
        .or_else(|| {
            js_sys::Reflect::get(err, &"message".into())
                .ok()
                .and_then(|v| v.as_string())
        })
        .unwrap_or_else(|| format!("{:?}", err))
}

fn js_error_name(err: &JsValue) -> Option<String> {
    js_sys::Reflect::get(err, &"name".into())
        .ok()
        .and_then(|v| v.as_string())
}

/// Serialize to plain JS objects (not `Map`s).
pub(crate) fn to_js<T: Serialize + ?Sized>(value: &T) -> Result<JsValue, serde_wasm_bindgen::Error> {
    value.serialize(&serde_wasm_bindgen::Serializer::json_compatible())
}

fn from_js_opt(value: JsValue) -> Option<Value> {
    if value.is_undefined() || value.is_null() {
        return None;
    }
    match serde_wasm_bindgen::from_value(value) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring non-JSON value from JS: {}", e);
            None
        }
    }
}

/// Keep a JS callback registered until the subscription drops, then call the
/// unsubscribe function the host returned.
fn js_subscription<F: ?Sized + 'static>(closure: Closure<F>, unsubscribe: JsValue) -> Subscription {
    let unsubscribe = unsubscribe.dyn_into::<js_sys::Function>().ok();
    Subscription::new(move || {
        if let Some(unsubscribe) = unsubscribe {
            if let Err(e) = unsubscribe.call0(&JsValue::NULL) {
                warn!("Unsubscribe threw: {}", js_error_message(&e));
            }
        }
        drop(closure);
    })
}

// ========== Broadcast channel ==========

struct ChannelInner {
    post_fn: js_sys::Function,
    response_time: Duration,
    messages: RefCell<Vec<UnboundedSender<Value>>>,
    internal: RefCell<Vec<UnboundedSender<ElectionMessage>>>,
}

/// Bridge to a browser `BroadcastChannel`.
///
/// # Example (TypeScript side)
///
/// ```typescript
/// const bc = new BroadcastChannel("tabsync");
/// const channel = new JsBroadcastChannel((msg) => bc.postMessage(msg));
/// bc.onmessage = (event) => channel.receive(event.data);
/// ```
#[wasm_bindgen]
#[derive(Clone)]
pub struct JsBroadcastChannel {
    inner: Rc<ChannelInner>,
}

#[wasm_bindgen]
impl JsBroadcastChannel {
    /// `post_fn(message)` sends to the other contexts. `response_time_ms`
    /// overrides the default election response window.
    #[wasm_bindgen(constructor)]
    pub fn new(post_fn: js_sys::Function, response_time_ms: Option<u32>) -> Self {
        Self {
            inner: Rc::new(ChannelInner {
                post_fn,
                response_time: response_time_ms
                    .map(|ms| Duration::from_millis(ms.into()))
                    .unwrap_or(DEFAULT_RESPONSE_TIME),
                messages: RefCell::new(Vec::new()),
                internal: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Feed in a message received from another context.
    pub fn receive(&self, data: JsValue) -> Result<(), JsError> {
        let value: Value = decode("channel message", data)?;
        match ElectionMessage::from_value(value.clone()) {
            Some(message) => deliver(&self.inner.internal, message),
            None => deliver(&self.inner.messages, value),
        }
        Ok(())
    }
}

fn deliver<T: Clone>(subscribers: &RefCell<Vec<UnboundedSender<T>>>, message: T) {
    let mut subscribers = subscribers.borrow_mut();
    subscribers.retain(|tx| !tx.is_closed());
    for tx in subscribers.iter() {
        let _ = tx.unbounded_send(message.clone());
    }
}

impl JsBroadcastChannel {
    fn post(&self, value: &Value) -> channel::Result<()> {
        let js = to_js(value).map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.inner
            .post_fn
            .call1(&JsValue::NULL, &js)
            .map_err(|e| TransportError::SendFailed(js_error_message(&e)))?;
        Ok(())
    }

    fn subscribe<T>(subscribers: &RefCell<Vec<UnboundedSender<T>>>) -> UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded();
        subscribers.borrow_mut().push(tx);
        rx
    }
}

impl BroadcastChannel for JsBroadcastChannel {
    fn post_message(&self, message: Value) -> channel::Result<()> {
        self.post(&message)
    }

    fn post_internal(&self, message: ElectionMessage) -> channel::Result<()> {
        self.post(&message.to_value())
    }

    fn subscribe_messages(&self) -> UnboundedReceiver<Value> {
        Self::subscribe(&self.inner.messages)
    }

    fn subscribe_internal(&self) -> UnboundedReceiver<ElectionMessage> {
        Self::subscribe(&self.inner.internal)
    }

    fn average_response_time(&self) -> Duration {
        self.inner.response_time
    }
}

// ========== Timer ==========

/// `setTimeout`-backed timer. Wall-clock time comes from `web-time`.
pub struct JsTimer;

#[async_trait(?Send)]
impl Timer for JsTimer {
    async fn sleep(&self, duration: Duration) {
        let ms = duration.as_millis().min(i32::MAX as u128) as i32;
        let promise = js_sys::Promise::new(&mut |resolve, _reject| {
            set_timeout(&resolve, ms);
        });
        let _ = JsFuture::from(promise).await;
    }
}

// ========== Store ==========

/// Bridge to the host application's store.
///
/// # Example (TypeScript side)
///
/// ```typescript
/// const bridge = new JsStore(
///   (type, payload) => store.commit(type, payload),
///   (type, payload) => store.dispatch(type, payload),
///   (cb) => store.subscribe(cb), // returns an unsubscribe function
/// );
/// ```
#[wasm_bindgen]
#[derive(Clone)]
pub struct JsStore {
    commit_fn: js_sys::Function,
    dispatch_fn: js_sys::Function,
    subscribe_fn: js_sys::Function,
}

#[wasm_bindgen]
impl JsStore {
    #[wasm_bindgen(constructor)]
    pub fn new(
        commit_fn: js_sys::Function,
        dispatch_fn: js_sys::Function,
        subscribe_fn: js_sys::Function,
    ) -> Self {
        Self {
            commit_fn,
            dispatch_fn,
            subscribe_fn,
        }
    }
}

impl JsStore {
    fn call(&self, func: &js_sys::Function, name: &str, payload: &Value) -> store::Result<()> {
        let payload = to_js(payload).map_err(|e| StoreError::Handler(e.to_string()))?;
        func.call2(&JsValue::NULL, &name.into(), &payload)
            .map_err(|e| StoreError::Handler(js_error_message(&e)))?;
        Ok(())
    }
}

impl Store for JsStore {
    fn commit(&self, name: &str, payload: Value) -> store::Result<()> {
        self.call(&self.commit_fn, name, &payload)
    }

    fn dispatch(&self, name: &str, payload: Value) -> store::Result<()> {
        self.call(&self.dispatch_fn, name, &payload)
    }

    fn subscribe_mutations(&self, callback: MutationCallback) -> Subscription {
        let closure = Closure::<dyn Fn(JsValue)>::new(move |mutation: JsValue| {
            match serde_wasm_bindgen::from_value::<Mutation>(mutation) {
                Ok(mutation) => callback(&mutation),
                Err(e) => warn!("Ignoring malformed mutation: {}", e),
            }
        });
        match self.subscribe_fn.call1(&JsValue::NULL, closure.as_ref().unchecked_ref()) {
            Ok(unsubscribe) => js_subscription(closure, unsubscribe),
            Err(e) => {
                error!("Store subscribe threw: {}", js_error_message(&e));
                Subscription::noop()
            }
        }
    }
}

// ========== Persistent storage ==========

/// Bridge to cross-tab storage (typically `localStorage` plus the `storage`
/// event).
///
/// `watch_fn(namespace, key, cb)` must call `cb(newValue, oldValue)` only for
/// writes made by other contexts and return an unsubscribe function.
#[wasm_bindgen]
#[derive(Clone)]
pub struct JsStorage {
    get_fn: js_sys::Function,
    set_fn: js_sys::Function,
    watch_fn: js_sys::Function,
}

#[wasm_bindgen]
impl JsStorage {
    #[wasm_bindgen(constructor)]
    pub fn new(get_fn: js_sys::Function, set_fn: js_sys::Function, watch_fn: js_sys::Function) -> Self {
        Self {
            get_fn,
            set_fn,
            watch_fn,
        }
    }
}

impl PersistentStorage for JsStorage {
    fn get(&self, namespace: &str, key: &str) -> Option<Value> {
        match self.get_fn.call2(&JsValue::NULL, &namespace.into(), &key.into()) {
            Ok(value) => from_js_opt(value),
            Err(e) => {
                warn!(namespace, key, "Storage read threw: {}", js_error_message(&e));
                None
            }
        }
    }

    fn set(&self, namespace: &str, key: &str, value: Value) -> storage::Result<()> {
        let value = to_js(&value).map_err(|e| StorageError::Unavailable(e.to_string()))?;
        self.set_fn
            .call3(&JsValue::NULL, &namespace.into(), &key.into(), &value)
            .map_err(|e| {
                let message = js_error_message(&e);
                if js_error_name(&e).as_deref() == Some("QuotaExceededError") {
                    StorageError::QuotaExceeded(message)
                } else {
                    StorageError::Unavailable(message)
                }
            })?;
        Ok(())
    }

    fn on_change(&self, namespace: &str, key: &str, callback: ChangeCallback) -> Subscription {
        let closure = Closure::<dyn Fn(JsValue, JsValue)>::new(move |new: JsValue, old: JsValue| {
            let new = from_js_opt(new);
            let old = from_js_opt(old);
            callback(new.as_ref(), old.as_ref());
        });
        match self.watch_fn.call3(
            &JsValue::NULL,
            &namespace.into(),
            &key.into(),
            closure.as_ref().unchecked_ref(),
        ) {
            Ok(unsubscribe) => js_subscription(closure, unsubscribe),
            Err(e) => {
                error!(namespace, key, "Storage watch threw: {}", js_error_message(&e));
                Subscription::noop()
            }
        }
    }
}

// ========== Change database ==========

#[derive(Deserialize)]
#[serde(untagged)]
enum PrimaryKeyJs {
    Single(String),
    Compound(Vec<String>),
}

/// Bridge to the embedded database's change feed.
///
/// # Example (TypeScript side)
///
/// ```typescript
/// const db = new JsChangeDatabase(
///   clientId,
///   { contentnode: "id", contentnode_prerequisite: ["target_node", "prerequisite"] },
///   (cb) => { dexie.on("changes", cb); return () => dexie.on("changes").unsubscribe(cb); },
/// );
/// ```
#[wasm_bindgen]
#[derive(Clone)]
pub struct JsChangeDatabase {
    client_id: ClientId,
    primary_keys: Rc<HashMap<String, KeyPath>>,
    subscribe_fn: js_sys::Function,
}

#[wasm_bindgen]
impl JsChangeDatabase {
    #[wasm_bindgen(constructor)]
    pub fn new(
        client_id: String,
        primary_keys: JsValue,
        subscribe_fn: js_sys::Function,
    ) -> Result<JsChangeDatabase, JsError> {
        let client_id: ClientId = client_id.parse().map_err(BridgeError::from)?;
        let primary_keys: HashMap<String, PrimaryKeyJs> = decode("primary keys", primary_keys)?;
        let primary_keys = primary_keys
            .into_iter()
            .map(|(table, key)| {
                let path = match key {
                    PrimaryKeyJs::Single(field) => KeyPath::Single(field),
                    PrimaryKeyJs::Compound(fields) => KeyPath::Compound(fields),
                };
                (table, path)
            })
            .collect();
        Ok(Self {
            client_id,
            primary_keys: Rc::new(primary_keys),
            subscribe_fn,
        })
    }
}

impl ChangeDatabase for JsChangeDatabase {
    fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn primary_key(&self, table: &str) -> Option<KeyPath> {
        self.primary_keys.get(table).cloned()
    }

    fn on_changes(&self, callback: ChangesCallback) -> Subscription {
        let closure = Closure::<dyn Fn(JsValue)>::new(move |changes: JsValue| {
            match serde_wasm_bindgen::from_value::<Vec<ChangeRecord>>(changes) {
                Ok(changes) => callback(&changes),
                Err(e) => warn!("Ignoring malformed change batch: {}", e),
            }
        });
        match self.subscribe_fn.call1(&JsValue::NULL, closure.as_ref().unchecked_ref()) {
            Ok(unsubscribe) => js_subscription(closure, unsubscribe),
            Err(e) => {
                error!("Change feed subscribe threw: {}", js_error_message(&e));
                Subscription::noop()
            }
        }
    }
}
