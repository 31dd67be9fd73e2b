//! Change merge engine.
//!
//! Collapses an ordered list of change records into at most one record per
//! `(table, key)`, ordered by each entity's first appearance. Folding rules
//! for one entity:
//!
//! - CREATE, UPDATE* → CREATE carrying the last state (no `oldObj`/`mods`)
//! - UPDATE+ → UPDATE with the first `oldObj`, the last `obj` and the
//!   `mods` merged in order (later key paths win)
//! - anything ending in DELETE → DELETE
//!
//! The merged record keeps the last folded record's `rev` and `source`.
//! Merging is pure and idempotent.

use crate::change::{ChangeRecord, ChangeType, JsonObject, apply_mods};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Fold `changes` into the minimal equivalent list.
///
/// `drop_intermediate` decides what an entity both created and deleted within
/// `changes` becomes: `true` drops it entirely (the server never needs to
/// hear about it), `false` keeps a DELETE.
pub fn merge_all_changes(
    changes: impl IntoIterator<Item = ChangeRecord>,
    drop_intermediate: bool,
) -> Vec<ChangeRecord> {
    let mut order: Vec<(String, String)> = Vec::new();
    let mut folds: HashMap<(String, String), Fold> = HashMap::new();

    for change in changes {
        let key = change.entity_key();
        match folds.get_mut(&key) {
            Some(fold) => fold.push(change),
            None => {
                order.push(key.clone());
                folds.insert(key, Fold::start(change));
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| folds.remove(&key))
        .filter_map(|fold| fold.finish(drop_intermediate))
        .collect()
}

/// Running fold for one entity.
struct Fold {
    /// First record wasn't a CREATE, so the entity predates the batch.
    existed_before: bool,
    /// `oldObj` of the first record: the state before the batch.
    base_old: Option<JsonObject>,
    acc: ChangeRecord,
}

impl Fold {
    fn start(change: ChangeRecord) -> Self {
        Self {
            existed_before: change.change_type != ChangeType::Created,
            base_old: change.old_obj.clone(),
            acc: normalize(change),
        }
    }

    fn push(&mut self, next: ChangeRecord) {
        if next.rev <= self.acc.rev {
            warn!(
                table = %next.table,
                key = %next.key,
                rev = next.rev,
                previous = self.acc.rev,
                "Change revs out of order; folding in input order"
            );
        }
        let rev = next.rev;
        let source = next.source.clone();

        match (self.acc.change_type, next.change_type) {
            (_, ChangeType::Created) => {
                self.acc = normalize(next);
            }
            (ChangeType::Created, ChangeType::Updated) => {
                self.acc.obj = Some(next_state(self.acc.obj.take(), &next));
            }
            (ChangeType::Updated, ChangeType::Updated) => {
                self.acc.obj = Some(next_state(self.acc.obj.take(), &next));
                self.acc.mods = merge_mods(self.acc.mods.take(), next.mods);
            }
            (ChangeType::Deleted, ChangeType::Updated) => {
                debug!(table = %next.table, key = %next.key, "Ignoring update to deleted entity");
            }
            (_, ChangeType::Deleted) => {
                let old_obj = if self.existed_before {
                    self.base_old.clone()
                } else {
                    None
                };
                self.acc = ChangeRecord {
                    old_obj,
                    obj: None,
                    mods: None,
                    change_type: ChangeType::Deleted,
                    ..next
                };
            }
        }

        self.acc.rev = rev;
        self.acc.source = source;
    }

    fn finish(self, drop_intermediate: bool) -> Option<ChangeRecord> {
        let created_and_deleted =
            !self.existed_before && self.acc.change_type == ChangeType::Deleted;
        if drop_intermediate && created_and_deleted {
            debug!(table = %self.acc.table, key = %self.acc.key, "Dropping entity created and deleted in batch");
            return None;
        }
        Some(self.acc)
    }
}

/// Strip fields that don't apply to the record's type.
fn normalize(mut change: ChangeRecord) -> ChangeRecord {
    match change.change_type {
        ChangeType::Created => {
            change.old_obj = None;
            change.mods = None;
        }
        ChangeType::Updated => {}
        ChangeType::Deleted => {
            change.obj = None;
            change.mods = None;
        }
    }
    change
}

/// State after `next`: its `obj` if present, else its `mods` applied to `current`.
fn next_state(current: Option<JsonObject>, next: &ChangeRecord) -> JsonObject {
    if let Some(obj) = &next.obj {
        return obj.clone();
    }
    let mut state = current.unwrap_or_default();
    if let Some(mods) = &next.mods {
        apply_mods(&mut state, mods);
    }
    state
}

fn merge_mods(current: Option<JsonObject>, next: Option<JsonObject>) -> Option<JsonObject> {
    match (current, next) {
        (None, None) => None,
        (Some(mods), None) | (None, Some(mods)) => Some(mods),
        (Some(mut mods), Some(next)) => {
            mods.extend(next);
            Some(mods)
        }
    }
}
