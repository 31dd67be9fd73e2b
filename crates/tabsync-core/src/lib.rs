//! tabsync-core: offline-first sync core shared by same-origin browser contexts.
//!
//! This crate provides:
//! - Leader election over a broadcast channel, so one context does network sync
//! - Merging of per-entity change records into minimal net changes
//! - Routing of database change feeds into the application store
//! - Persisting store mutations into cross-tab storage
//! - Trait seams for every collaborator (`BroadcastChannel`, `ChangeDatabase`,
//!   `Store`, `PersistentStorage`, `Timer`) with in-memory implementations

pub mod change;
pub mod channel;
pub mod client_id;
pub mod database;
pub mod election;
pub mod events;
pub mod merge;
pub mod persist;
pub mod router;
pub mod storage;
pub mod store;
pub mod time;

pub use change::{ChangeRecord, ChangeType, ChangeTypeError, JsonObject};
pub use channel::{BroadcastChannel, BroadcastHub, InMemoryChannel, TransportError};
pub use client_id::{ClientId, ClientIdError};
pub use database::{ChangeDatabase, DatabaseError, InMemoryDatabase, KeyPath};
pub use election::{
    ElectionConfig, ElectionError, ElectionMessage, ElectionToken, LeaderElection,
    LeadershipHandlers,
};
pub use events::{EventBus, HandlerError, Subscription};
pub use merge::merge_all_changes;
pub use persist::{
    PersistError, PersistHandle, PersistenceMapping, persist_all_factory, persist_factory,
};
pub use router::{
    ChangeRouter, Listener, ListenerBinding, RouterError, RouterHandle, change_router_plugin,
    commit_listener, dispatch_listener,
};
pub use storage::{InMemoryStorage, PersistentStorage, StorageError, StorageHub};
pub use store::{MemoryStore, Mutation, Store, StoreError};
pub use time::Timer;
