//! WASM bindings for tabsync-core.
//!
//! Provides the bridge between the browser host page and Rust (tabsync-core).
//!
//! # Architecture
//!
//! The host page constructs bridge objects around its own primitives and
//! hands them to the exported entry points:
//!
//! ```text
//! JavaScript                       WASM (Rust)
//! ──────────                       ───────────
//! BroadcastChannel ──callbacks──> JsBroadcastChannel ──> WasmLeaderElection
//! Dexie change feed ─callbacks──> JsChangeDatabase ──┐
//! application store ─callbacks──> JsStore ───────────┼─> changeRouterPlugin
//! localStorage ──────callbacks──> JsStorage ─────────┴─> persistFactory
//! ```
//!
//! **Note**: This crate only compiles for `wasm32` targets. When building for native
//! targets (e.g., during `cargo check --workspace`), this crate provides no exports.

#[cfg(target_arch = "wasm32")]
mod bridge;

#[cfg(target_arch = "wasm32")]
pub use bridge::{BridgeError, JsBroadcastChannel, JsChangeDatabase, JsStorage, JsStore, JsTimer};

// ============================================================================
// All WASM-specific code is gated behind target_arch = "wasm32"
// This allows `cargo check --workspace` to succeed on native targets.
// ============================================================================

#[cfg(target_arch = "wasm32")]
mod wasm_impl {
    use super::bridge::{self, JsBroadcastChannel, JsChangeDatabase, JsStorage, JsStore, JsTimer};
    use std::any::Any;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tabsync_core::{
        ChangeRecord, ChangeTypeError, ClientId, ElectionConfig, LeaderElection, LeadershipHandlers, Listener,
        RouterError, StoreError, change_router_plugin, commit_listener, dispatch_listener,
        merge_all_changes, persist_all_factory, persist_factory,
    };
    use tracing_subscriber::layer::SubscriberExt;
    use wasm_bindgen::JsCast;
    use wasm_bindgen::prelude::*;

    // ========== Callback Logger Layer ==========

    thread_local! {
        static LOGGER_CALLBACK: RefCell<Option<js_sys::Function>> = const { RefCell::new(None) };
    }

    /// A tracing layer that invokes a JavaScript callback for each log event.
    struct JsCallbackLayer;

    impl<S> tracing_subscriber::Layer<S> for JsCallbackLayer
    where
        S: tracing::Subscriber,
    {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            LOGGER_CALLBACK.with(|cb| {
                let cb = cb.borrow();
                let Some(callback) = cb.as_ref() else {
                    return;
                };
                let metadata = event.metadata();

                let mut visitor = MessageVisitor::default();
                event.record(&mut visitor);

                let js_event = js_sys::Object::new();
                let _ = js_sys::Reflect::set(&js_event, &"level".into(), &metadata.level().as_str().into());
                let _ = js_sys::Reflect::set(&js_event, &"target".into(), &metadata.target().into());
                let _ = js_sys::Reflect::set(&js_event, &"message".into(), &visitor.message.into());
                let _ = js_sys::Reflect::set(
                    &js_event,
                    &"timestamp".into(),
                    &timestamp_ms().into(),
                );
                let _ = callback.call1(&JsValue::NULL, &js_event);
            });
        }
    }

    fn timestamp_ms() -> f64 {
        web_time::SystemTime::now()
            .duration_since(web_time::UNIX_EPOCH)
            .map(|d| d.as_millis() as f64)
            .unwrap_or(0.0)
    }

    /// Flattens event fields into one line: the message, then `name=value`.
    #[derive(Default)]
    struct MessageVisitor {
        message: String,
    }

    impl MessageVisitor {
        fn push_field(&mut self, name: &str, value: String) {
            if name == "message" {
                self.message = if self.message.is_empty() {
                    value
                } else {
                    format!("{} {}", value, self.message)
                };
            } else {
                if !self.message.is_empty() {
                    self.message.push(' ');
                }
                self.message.push_str(&format!("{}={}", name, value));
            }
        }
    }

    impl tracing::field::Visit for MessageVisitor {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            self.push_field(field.name(), format!("{:?}", value));
        }

        fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
            self.push_field(field.name(), value.to_string());
        }
    }

    /// Initialize the WASM module (sets up panic hook and tracing).
    ///
    /// Accepts an optional configuration object:
    /// - `init()` - console-only logging (default)
    /// - `init({ logger: (event) => {...} })` - callback + console logging
    ///
    /// The logger callback receives events with: `{ level, target, message, timestamp }`
    #[wasm_bindgen]
    pub fn init(config: Option<js_sys::Object>) {
        console_error_panic_hook::set_once();

        let callback = config
            .as_ref()
            .and_then(|cfg| js_sys::Reflect::get(cfg, &"logger".into()).ok())
            .and_then(|v| v.dyn_into::<js_sys::Function>().ok());

        let console_config = tracing_wasm::WASMLayerConfigBuilder::new()
            .set_max_level(tracing::Level::DEBUG)
            .build();

        match callback {
            Some(cb) => {
                LOGGER_CALLBACK.with(|cell| *cell.borrow_mut() = Some(cb));
                let subscriber = tracing_subscriber::registry()
                    .with(JsCallbackLayer)
                    .with(tracing_wasm::WASMLayer::new(console_config));
                tracing::subscriber::set_global_default(subscriber).ok();
            }
            None => tracing_wasm::set_as_global_default_with_config(console_config),
        }

        tracing::info!("tabsync-wasm initialized");
    }

    /// Get version string
    #[wasm_bindgen]
    pub fn version() -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    /// Generate a new random client ID.
    ///
    /// Returns a 16-character hex string. Pass it to `JsChangeDatabase` and
    /// stamp it as the source of every local write.
    #[wasm_bindgen(js_name = generateClientId)]
    pub fn generate_client_id() -> String {
        ClientId::generate().to_string()
    }

    /// Fold a batch of change records into at most one record per entity.
    #[wasm_bindgen(js_name = mergeAllChanges)]
    pub fn merge_all_changes_js(changes: JsValue, drop_intermediate: Option<bool>) -> Result<JsValue, JsError> {
        let changes: Vec<ChangeRecord> = bridge::decode("change records", changes)?;
        let merged = merge_all_changes(changes, drop_intermediate.unwrap_or(false));
        bridge::to_js(&merged).map_err(|e| JsError::new(&e.to_string()))
    }

    // ========== WASM Subscription Handle ==========

    /// Handle for an installed plugin or callback.
    ///
    /// Call `dispose()` to uninstall, or let the JS garbage collector
    /// collect it (the Rust Drop will run via FinalizationRegistry).
    #[wasm_bindgen]
    pub struct WasmSubscription {
        inner: RefCell<Option<Box<dyn Any>>>,
    }

    impl WasmSubscription {
        fn new(inner: impl Any) -> Self {
            Self {
                inner: RefCell::new(Some(Box::new(inner))),
            }
        }
    }

    #[wasm_bindgen]
    impl WasmSubscription {
        /// Uninstall. Safe to call multiple times.
        pub fn dispose(&self) {
            self.inner.borrow_mut().take();
        }
    }

    // ========== Leader election ==========

    type Election = LeaderElection<JsBroadcastChannel, JsTimer>;

    /// Leader elector exposed to JavaScript.
    ///
    /// The message pump starts on construction and stops after `die()`.
    #[wasm_bindgen]
    pub struct WasmLeaderElection {
        inner: Election,
    }

    #[wasm_bindgen]
    impl WasmLeaderElection {
        /// `config` accepts `{ responseTime?, fallbackInterval?, dictator? }`
        /// with durations in milliseconds.
        #[wasm_bindgen(constructor)]
        pub fn new(channel: &JsBroadcastChannel, config: JsValue) -> Result<WasmLeaderElection, JsError> {
            let config: ElectionConfig = if config.is_undefined() || config.is_null() {
                ElectionConfig::default()
            } else {
                bridge::decode("election config", config)?
            };
            let inner = LeaderElection::new(channel.clone(), JsTimer, config);
            let driver = inner.clone();
            wasm_bindgen_futures::spawn_local(async move { driver.run().await });
            Ok(Self { inner })
        }

        /// Resolves once this context is leader. `success` runs on winning,
        /// `cleanup` when leadership is later lost.
        #[wasm_bindgen(js_name = awaitLeadership)]
        pub fn await_leadership(
            &self,
            success: Option<js_sys::Function>,
            cleanup: Option<js_sys::Function>,
        ) -> js_sys::Promise {
            let mut handlers = LeadershipHandlers::new();
            if let Some(success) = success {
                handlers = handlers.on_success(move || call_handler(&success));
            }
            if let Some(cleanup) = cleanup {
                handlers = handlers.on_cleanup(move || call_handler(&cleanup));
            }
            let election = self.inner.clone();
            wasm_bindgen_futures::future_to_promise(async move {
                election
                    .await_leadership(handlers)
                    .await
                    .map(|()| JsValue::UNDEFINED)
                    .map_err(|e| JsError::new(&e.to_string()).into())
            })
        }

        /// Resolves once any context is known to lead.
        #[wasm_bindgen(js_name = waitForLeader)]
        pub fn wait_for_leader(&self) -> js_sys::Promise {
            let election = self.inner.clone();
            wasm_bindgen_futures::future_to_promise(async move {
                election
                    .wait_for_leader()
                    .await
                    .map(|()| JsValue::UNDEFINED)
                    .map_err(|e| JsError::new(&e.to_string()).into())
            })
        }

        /// Give up leadership without leaving the election.
        pub fn depose(&self) {
            self.inner.depose();
        }

        /// Leave the election for good. Call from `beforeunload`.
        pub fn die(&self) {
            self.inner.die();
        }

        #[wasm_bindgen(getter, js_name = isLeader)]
        pub fn is_leader(&self) -> bool {
            self.inner.is_leader()
        }

        #[wasm_bindgen(getter, js_name = isDead)]
        pub fn is_dead(&self) -> bool {
            self.inner.is_dead()
        }

        #[wasm_bindgen(getter, js_name = leaderExists)]
        pub fn leader_exists(&self) -> bool {
            self.inner.leader_exists()
        }

        #[wasm_bindgen(getter, js_name = isDictator)]
        pub fn is_dictator(&self) -> bool {
            self.inner.is_dictator()
        }

        #[wasm_bindgen(getter)]
        pub fn token(&self) -> String {
            self.inner.token().to_string()
        }
    }

    fn call_handler(handler: &js_sys::Function) {
        if let Err(e) = handler.call0(&JsValue::NULL) {
            tracing::error!("Leadership handler threw: {}", bridge::js_error_message(&e));
        }
    }

    // ========== Change router ==========

    fn get_string(spec: &JsValue, key: &str) -> Option<String> {
        js_sys::Reflect::get(spec, &key.into())
            .ok()
            .and_then(|v| v.as_string())
    }

    fn get_as<T: JsCast>(spec: &JsValue, key: &str) -> Option<T> {
        js_sys::Reflect::get(spec, &key.into())
            .ok()
            .and_then(|v| v.dyn_into::<T>().ok())
    }

    /// Build the unbound action part of one listener spec.
    fn listener_action(spec: &JsValue) -> Result<Listener<JsStore>, JsError> {
        if let Some(name) = get_string(spec, "commit") {
            return Ok(commit_listener(&name));
        }
        if let Some(name) = get_string(spec, "dispatch") {
            return Ok(dispatch_listener(&name));
        }
        if let Some(callback) = get_as::<js_sys::Function>(spec, "callback") {
            return Ok(Listener::new(move |_store: &JsStore, payload| {
                let payload = bridge::to_js(&payload).map_err(|e| StoreError::Handler(e.to_string()))?;
                callback
                    .call1(&JsValue::NULL, &payload)
                    .map_err(|e| StoreError::Handler(bridge::js_error_message(&e)))?;
                Ok(())
            }));
        }
        if let Some(group) = get_as::<js_sys::Array>(spec, "group") {
            let actions = group
                .iter()
                .map(|member| listener_action(&member))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Listener::group(actions));
        }
        Err(JsError::new(
            "Listener needs one of `commit`, `dispatch`, `callback` or `group`",
        ))
    }

    /// A JS number naming a change type. Anything that is not a whole number
    /// in `u8` range is rejected here; `ChangeType` rejects the rest.
    fn change_code(code: f64) -> Result<u8, RouterError> {
        if code.fract() == 0.0 && (0.0..=f64::from(u8::MAX)).contains(&code) {
            Ok(code as u8)
        } else {
            Err(ChangeTypeError::InvalidName(code.to_string()).into())
        }
    }

    fn router_error(e: RouterError) -> JsError {
        JsError::new(&e.to_string())
    }

    /// Route the database change feed into the store.
    ///
    /// Each listener spec is
    /// `{ table, changeType, namespace?, commit? | dispatch? | callback? | group? }`
    /// where `changeType` is `"created"`, `"updated"`, `"deleted"` or `1..=3`.
    #[wasm_bindgen(js_name = changeRouterPlugin)]
    pub fn change_router_plugin_js(
        db: &JsChangeDatabase,
        store: &JsStore,
        listeners: js_sys::Array,
    ) -> Result<WasmSubscription, JsError> {
        let mut bound = Vec::new();
        for spec in listeners.iter() {
            let table = get_string(&spec, "table").unwrap_or_default();
            let namespace = get_string(&spec, "namespace");
            let change_type = js_sys::Reflect::get(&spec, &"changeType".into()).unwrap_or(JsValue::UNDEFINED);
            let action = listener_action(&spec)?;
            let listener = match (change_type.as_string(), change_type.as_f64()) {
                (Some(name), _) => action.bind(&table, name.as_str(), namespace.as_deref()),
                (None, Some(code)) => {
                    change_code(code).and_then(|code| action.bind(&table, code, namespace.as_deref()))
                }
                (None, None) => Err(RouterError::Unbound),
            }
            .map_err(router_error)?;
            bound.push(listener);
        }

        let handle = change_router_plugin(Rc::new(db.clone()), bound)(Rc::new(store.clone()))
            .map_err(router_error)?;
        Ok(WasmSubscription::new(handle))
    }

    // ========== Persistence ==========

    /// Mirror the latest payload of each named mutation into storage.
    #[wasm_bindgen(js_name = persistFactory)]
    pub fn persist_factory_js(
        storage: &JsStorage,
        store: &JsStore,
        namespace: &str,
        mutations: Vec<String>,
        prefix_mutations: Option<bool>,
    ) -> Result<WasmSubscription, JsError> {
        let mutations: Vec<&str> = mutations.iter().map(String::as_str).collect();
        let handle = persist_factory(
            Rc::new(storage.clone()),
            namespace,
            &mutations,
            prefix_mutations.unwrap_or(true),
        )(Rc::new(store.clone()))
        .map_err(|e| JsError::new(&e.to_string()))?;
        Ok(WasmSubscription::new(handle))
    }

    /// Mirror every distinct payload of each named mutation into storage.
    #[wasm_bindgen(js_name = persistAllFactory)]
    pub fn persist_all_factory_js(
        storage: &JsStorage,
        store: &JsStore,
        namespace: &str,
        mutations: Vec<String>,
        prefix_mutations: Option<bool>,
    ) -> Result<WasmSubscription, JsError> {
        let mutations: Vec<&str> = mutations.iter().map(String::as_str).collect();
        let handle = persist_all_factory(
            Rc::new(storage.clone()),
            namespace,
            &mutations,
            prefix_mutations.unwrap_or(true),
        )(Rc::new(store.clone()))
        .map_err(|e| JsError::new(&e.to_string()))?;
        Ok(WasmSubscription::new(handle))
    }
}

// Re-export wasm_impl contents at crate root for wasm32 targets
#[cfg(target_arch = "wasm32")]
pub use wasm_impl::*;
