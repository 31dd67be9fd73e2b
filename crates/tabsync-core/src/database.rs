//! Embedded database seam.
//!
//! The router needs three things from the local database: the client id it
//! tags local writes with, each table's primary key path, and a batched
//! change feed. `InMemoryDatabase` provides all three for tests and
//! same-process use.

use crate::change::{ChangeRecord, ChangeType, JsonObject, apply_mods};
use crate::client_id::ClientId;
use crate::events::Subscription;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Missing primary key field {field:?} in {table}")]
    MissingKey { table: String, field: String },

    #[error("Not found: {table} {key}")]
    NotFound { table: String, key: Value },
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Primary key of a table: one field, or several for compound keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPath {
    Single(String),
    Compound(Vec<String>),
}

impl KeyPath {
    pub fn single(field: impl Into<String>) -> Self {
        KeyPath::Single(field.into())
    }

    pub fn compound<I, F>(fields: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<String>,
    {
        KeyPath::Compound(fields.into_iter().map(Into::into).collect())
    }

    /// Read the key out of an object. Compound keys become arrays.
    pub fn extract(&self, obj: &JsonObject) -> Option<Value> {
        match self {
            KeyPath::Single(field) => obj.get(field).cloned(),
            KeyPath::Compound(fields) => fields
                .iter()
                .map(|f| obj.get(f).cloned())
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
        }
    }

    /// Write the key's fields into an object. Compound keys are spread
    /// positionally; returns false if `key` doesn't fit the path.
    pub fn inject(&self, obj: &mut JsonObject, key: &Value) -> bool {
        match self {
            KeyPath::Single(field) => {
                obj.insert(field.clone(), key.clone());
                true
            }
            KeyPath::Compound(fields) => match key {
                Value::Array(parts) if parts.len() == fields.len() => {
                    for (field, part) in fields.iter().zip(parts) {
                        obj.insert(field.clone(), part.clone());
                    }
                    true
                }
                _ => false,
            },
        }
    }
}

pub type ChangesCallback = Box<dyn Fn(&[ChangeRecord])>;

pub trait ChangeDatabase {
    /// Id this process tags its own writes with.
    fn client_id(&self) -> ClientId;

    fn primary_key(&self, table: &str) -> Option<KeyPath>;

    /// Receive every batch of changes until the handle drops.
    fn on_changes(&self, callback: ChangesCallback) -> Subscription;
}

type Listener = Rc<dyn Fn(&[ChangeRecord])>;

struct Table {
    key_path: KeyPath,
    rows: HashMap<String, JsonObject>,
}

#[derive(Default)]
struct DbState {
    tables: HashMap<String, Table>,
    revs: HashMap<(String, String), u64>,
    /// Local writes not yet taken for upstream sync.
    pending: Vec<ChangeRecord>,
    listeners: Vec<(usize, Listener)>,
}

/// Single-process database with a change feed.
///
/// Local writes (`put`, `update`, `delete`) are tagged with the database's
/// client id and queued for sync; `apply_remote` lands writes from elsewhere
/// keeping their source.
#[derive(Clone)]
pub struct InMemoryDatabase {
    client_id: ClientId,
    state: Rc<RefCell<DbState>>,
    next_id: Rc<Cell<usize>>,
}

impl InMemoryDatabase {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            state: Rc::new(RefCell::new(DbState::default())),
            next_id: Rc::new(Cell::new(0)),
        }
    }

    pub fn with_table(self, name: &str, key_path: KeyPath) -> Self {
        self.state.borrow_mut().tables.insert(
            name.to_string(),
            Table {
                key_path,
                rows: HashMap::new(),
            },
        );
        self
    }

    pub fn get(&self, table: &str, key: &Value) -> Option<JsonObject> {
        self.state
            .borrow()
            .tables
            .get(table)
            .and_then(|t| t.rows.get(&key.to_string()))
            .cloned()
    }

    /// Insert or replace a row. Emits CREATED, or UPDATED with the changed
    /// top-level fields as `mods`.
    pub fn put(&self, table: &str, obj: JsonObject) -> Result<Value> {
        let (key, old_obj) = {
            let state = self.state.borrow();
            let t = state
                .tables
                .get(table)
                .ok_or_else(|| DatabaseError::UnknownTable(table.to_string()))?;
            let key = t.key_path.extract(&obj).ok_or_else(|| DatabaseError::MissingKey {
                table: table.to_string(),
                field: format!("{:?}", t.key_path),
            })?;
            let old = t.rows.get(&key.to_string()).cloned();
            (key, old)
        };

        let change = match old_obj {
            None => ChangeRecord::created(table, key.clone(), obj),
            Some(old_obj) => {
                let mods = diff(&old_obj, &obj);
                ChangeRecord::updated(table, key.clone(), Some(old_obj), mods, Some(obj))
            }
        };
        self.write_local(vec![change]);
        Ok(key)
    }

    /// Apply `mods` (dotted key paths) to an existing row.
    pub fn update(&self, table: &str, key: impl Into<Value>, mods: JsonObject) -> Result<()> {
        let key = key.into();
        let old_obj = self.existing(table, &key)?;
        let mut obj = old_obj.clone();
        apply_mods(&mut obj, &mods);
        let change = ChangeRecord::updated(table, key, Some(old_obj), mods, Some(obj));
        self.write_local(vec![change]);
        Ok(())
    }

    pub fn delete(&self, table: &str, key: impl Into<Value>) -> Result<()> {
        let key = key.into();
        let old_obj = self.existing(table, &key)?;
        self.write_local(vec![ChangeRecord::deleted(table, key, Some(old_obj))]);
        Ok(())
    }

    /// Land a batch written by another client. Records keep their `source`;
    /// unknown tables are skipped.
    pub fn apply_remote(&self, changes: Vec<ChangeRecord>) {
        let changes = {
            let mut state = self.state.borrow_mut();
            changes
                .into_iter()
                .filter_map(|mut change| {
                    if !state.tables.contains_key(&change.table) {
                        debug!(table = %change.table, "Skipping remote change for unknown table");
                        return None;
                    }
                    change.rev = state.bump_rev(&change);
                    state.store(&change);
                    Some(change)
                })
                .collect::<Vec<_>>()
        };
        self.emit(&changes);
    }

    /// Drain local writes awaiting upstream sync, oldest first.
    pub fn take_pending(&self) -> Vec<ChangeRecord> {
        std::mem::take(&mut self.state.borrow_mut().pending)
    }

    fn existing(&self, table: &str, key: &Value) -> Result<JsonObject> {
        let state = self.state.borrow();
        let t = state
            .tables
            .get(table)
            .ok_or_else(|| DatabaseError::UnknownTable(table.to_string()))?;
        t.rows
            .get(&key.to_string())
            .cloned()
            .ok_or_else(|| DatabaseError::NotFound {
                table: table.to_string(),
                key: key.clone(),
            })
    }

    fn write_local(&self, changes: Vec<ChangeRecord>) {
        let source = self.client_id.to_string();
        let changes: Vec<ChangeRecord> = {
            let mut state = self.state.borrow_mut();
            changes
                .into_iter()
                .map(|change| {
                    let rev = state.bump_rev(&change);
                    let change = change.with_rev(rev).with_source(source.as_str());
                    state.store(&change);
                    state.pending.push(change.clone());
                    change
                })
                .collect()
        };
        self.emit(&changes);
    }

    fn emit(&self, changes: &[ChangeRecord]) {
        if changes.is_empty() {
            return;
        }
        let listeners: Vec<Listener> = self
            .state
            .borrow()
            .listeners
            .iter()
            .map(|(_, l)| Rc::clone(l))
            .collect();
        for listener in listeners {
            listener(changes);
        }
    }
}

impl DbState {
    fn bump_rev(&mut self, change: &ChangeRecord) -> u64 {
        let rev = self.revs.entry(change.entity_key()).or_insert(0);
        *rev += 1;
        *rev
    }

    fn store(&mut self, change: &ChangeRecord) {
        let Some(table) = self.tables.get_mut(&change.table) else {
            return;
        };
        let key = change.key.to_string();
        match change.change_type {
            ChangeType::Created => {
                table.rows.insert(key, change.obj.clone().unwrap_or_default());
            }
            ChangeType::Updated => {
                let row = table.rows.entry(key).or_default();
                match (&change.obj, &change.mods) {
                    (Some(obj), _) => *row = obj.clone(),
                    (None, Some(mods)) => apply_mods(row, mods),
                    (None, None) => {}
                }
            }
            ChangeType::Deleted => {
                table.rows.remove(&key);
            }
        }
    }
}

impl ChangeDatabase for InMemoryDatabase {
    fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn primary_key(&self, table: &str) -> Option<KeyPath> {
        self.state
            .borrow()
            .tables
            .get(table)
            .map(|t| t.key_path.clone())
    }

    fn on_changes(&self, callback: ChangesCallback) -> Subscription {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.state
            .borrow_mut()
            .listeners
            .push((id, Rc::from(callback)));

        let state: Weak<RefCell<DbState>> = Rc::downgrade(&self.state);
        Subscription::new(move || {
            if let Some(state) = state.upgrade() {
                if let Ok(mut state) = state.try_borrow_mut() {
                    state.listeners.retain(|(i, _)| *i != id);
                }
            }
        })
    }
}

/// Top-level fields of `new` that differ from `old`. Removed fields map to null.
fn diff(old: &JsonObject, new: &JsonObject) -> JsonObject {
    let mut mods: JsonObject = new
        .iter()
        .filter(|(k, v)| old.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for key in old.keys() {
        if !new.contains_key(key) {
            mods.insert(key.clone(), Value::Null);
        }
    }
    mods
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> JsonObject {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn database() -> InMemoryDatabase {
        InMemoryDatabase::new(ClientId::from(7))
            .with_table("contentnode", KeyPath::single("id"))
            .with_table(
                "contentnode_prerequisite",
                KeyPath::compound(["target_node", "prerequisite"]),
            )
    }

    fn record_batches(db: &InMemoryDatabase) -> (Rc<RefCell<Vec<Vec<ChangeRecord>>>>, Subscription) {
        let batches = Rc::new(RefCell::new(Vec::new()));
        let batches_clone = Rc::clone(&batches);
        let sub = db.on_changes(Box::new(move |changes| {
            batches_clone.borrow_mut().push(changes.to_vec());
        }));
        (batches, sub)
    }

    #[test]
    fn test_key_path_extract_and_inject() {
        let compound = KeyPath::compound(["a", "b"]);
        let obj = object(json!({"a": 1, "b": "x", "c": true}));
        assert_eq!(compound.extract(&obj), Some(json!([1, "x"])));
        assert_eq!(compound.extract(&object(json!({"a": 1}))), None);

        let mut target = JsonObject::new();
        assert!(compound.inject(&mut target, &json!([2, "y"])));
        assert_eq!(Value::Object(target.clone()), json!({"a": 2, "b": "y"}));
        assert!(!compound.inject(&mut target, &json!("scalar")));
    }

    #[test]
    fn test_local_writes_are_tagged_and_revved() {
        let db = database();
        let (batches, _sub) = record_batches(&db);

        db.put("contentnode", object(json!({"id": "n1", "title": "a"})))
            .unwrap();
        db.put("contentnode", object(json!({"id": "n1", "title": "b"})))
            .unwrap();
        db.delete("contentnode", "n1").unwrap();

        let batches = batches.borrow();
        assert_eq!(batches.len(), 3);
        let types: Vec<_> = batches.iter().map(|b| b[0].change_type).collect();
        assert_eq!(
            types,
            vec![ChangeType::Created, ChangeType::Updated, ChangeType::Deleted]
        );
        let revs: Vec<_> = batches.iter().map(|b| b[0].rev).collect();
        assert_eq!(revs, vec![1, 2, 3]);
        assert!(
            batches
                .iter()
                .all(|b| b[0].source.as_deref() == Some("0000000000000007"))
        );
        assert_eq!(batches[1][0].mods, Some(object(json!({"title": "b"}))));
        assert!(db.get("contentnode", &json!("n1")).is_none());
    }

    #[test]
    fn test_update_applies_mods() {
        let db = database();
        db.put(
            "contentnode",
            object(json!({"id": "n1", "extra_fields": {"m": 1}})),
        )
        .unwrap();
        db.update("contentnode", "n1", object(json!({"extra_fields.n": 2})))
            .unwrap();

        assert_eq!(
            db.get("contentnode", &json!("n1")).map(Value::Object),
            Some(json!({"id": "n1", "extra_fields": {"m": 1, "n": 2}}))
        );
    }

    #[test]
    fn test_errors() {
        let db = database();
        assert!(matches!(
            db.put("missing", JsonObject::new()),
            Err(DatabaseError::UnknownTable(_))
        ));
        assert!(matches!(
            db.put("contentnode", object(json!({"title": "no id"}))),
            Err(DatabaseError::MissingKey { .. })
        ));
        assert!(matches!(
            db.delete("contentnode", "ghost"),
            Err(DatabaseError::NotFound { .. })
        ));
    }

    #[test]
    fn test_remote_changes_keep_source_and_skip_pending() {
        let db = database();
        let (batches, _sub) = record_batches(&db);

        db.apply_remote(vec![
            ChangeRecord::created("contentnode", "r1", object(json!({"id": "r1"})))
                .with_source("00000000000000aa"),
            ChangeRecord::created("unknown", "x", JsonObject::new()),
        ]);

        assert_eq!(batches.borrow().len(), 1);
        assert_eq!(batches.borrow()[0].len(), 1);
        assert_eq!(
            batches.borrow()[0][0].source.as_deref(),
            Some("00000000000000aa")
        );
        assert!(db.get("contentnode", &json!("r1")).is_some());
        assert!(db.take_pending().is_empty());
    }

    #[test]
    fn test_take_pending_drains() {
        let db = database();
        db.put("contentnode", object(json!({"id": "n1"}))).unwrap();
        db.put(
            "contentnode_prerequisite",
            object(json!({"target_node": "n1", "prerequisite": "n2"})),
        )
        .unwrap();

        let pending = db.take_pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[1].key, json!(["n1", "n2"]));
        assert!(db.take_pending().is_empty());
    }

    #[test]
    fn test_dropped_subscription_stops_feed() {
        let db = database();
        let (batches, sub) = record_batches(&db);
        drop(sub);
        db.put("contentnode", object(json!({"id": "n1"}))).unwrap();
        assert!(batches.borrow().is_empty());
    }
}
