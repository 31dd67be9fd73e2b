//! Change records emitted by the embedded database.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// A JSON object: an entity's state or a partial diff.
pub type JsonObject = Map<String, Value>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChangeTypeError {
    #[error("Invalid change type: {0}")]
    InvalidCode(u8),
    #[error("Invalid change type: {0:?}")]
    InvalidName(String),
}

/// Kind of write. Serializes as the integers 1, 2 and 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ChangeType {
    Created = 1,
    Updated = 2,
    Deleted = 3,
}

impl ChangeType {
    pub const ALL: [ChangeType; 3] = [ChangeType::Created, ChangeType::Updated, ChangeType::Deleted];

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl From<ChangeType> for u8 {
    fn from(change_type: ChangeType) -> u8 {
        change_type.code()
    }
}

impl TryFrom<u8> for ChangeType {
    type Error = ChangeTypeError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(ChangeType::Created),
            2 => Ok(ChangeType::Updated),
            3 => Ok(ChangeType::Deleted),
            other => Err(ChangeTypeError::InvalidCode(other)),
        }
    }
}

impl FromStr for ChangeType {
    type Err = ChangeTypeError;

    /// Accepts the integer codes and the names, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "1" | "created" | "create" => Ok(ChangeType::Created),
            "2" | "updated" | "update" => Ok(ChangeType::Updated),
            "3" | "deleted" | "delete" => Ok(ChangeType::Deleted),
            _ => Err(ChangeTypeError::InvalidName(s.to_string())),
        }
    }
}

impl TryFrom<&str> for ChangeType {
    type Error = ChangeTypeError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl Display for ChangeType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeType::Created => "CREATED",
            ChangeType::Updated => "UPDATED",
            ChangeType::Deleted => "DELETED",
        })
    }
}

/// One create, update or delete of one entity.
///
/// For a given `(table, key)`, `rev` strictly increases in the order the
/// records were written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub table: String,
    /// Primary key; an array for compound keys.
    pub key: Value,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    /// State after the write. Absent for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obj: Option<JsonObject>,
    /// State before the write. Absent for creates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_obj: Option<JsonObject>,
    /// Key path → new value. Updates only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mods: Option<JsonObject>,
    #[serde(default)]
    pub rev: u64,
    /// Client id of the process that made the write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl ChangeRecord {
    fn new(table: &str, key: Value, change_type: ChangeType) -> Self {
        Self {
            table: table.to_string(),
            key,
            change_type,
            obj: None,
            old_obj: None,
            mods: None,
            rev: 0,
            source: None,
        }
    }

    pub fn created(table: &str, key: impl Into<Value>, obj: JsonObject) -> Self {
        Self {
            obj: Some(obj),
            ..Self::new(table, key.into(), ChangeType::Created)
        }
    }

    pub fn updated(
        table: &str,
        key: impl Into<Value>,
        old_obj: Option<JsonObject>,
        mods: JsonObject,
        obj: Option<JsonObject>,
    ) -> Self {
        Self {
            old_obj,
            mods: Some(mods),
            obj,
            ..Self::new(table, key.into(), ChangeType::Updated)
        }
    }

    pub fn deleted(table: &str, key: impl Into<Value>, old_obj: Option<JsonObject>) -> Self {
        Self {
            old_obj,
            ..Self::new(table, key.into(), ChangeType::Deleted)
        }
    }

    pub fn with_rev(mut self, rev: u64) -> Self {
        self.rev = rev;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Grouping key: table plus the canonical JSON encoding of the key.
    pub fn entity_key(&self) -> (String, String) {
        (self.table.clone(), self.key.to_string())
    }
}

/// Apply `mods` to `obj`. Keys are dotted key paths; missing or non-object
/// intermediate values are replaced with empty objects.
pub fn apply_mods(obj: &mut JsonObject, mods: &JsonObject) {
    for (path, value) in mods {
        set_key_path(obj, path, value.clone());
    }
}

fn set_key_path(obj: &mut JsonObject, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            obj.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = obj
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(JsonObject::new()));
            if !child.is_object() {
                *child = Value::Object(JsonObject::new());
            }
            if let Value::Object(child) = child {
                set_key_path(child, rest, value);
            }
        }
    }
}
