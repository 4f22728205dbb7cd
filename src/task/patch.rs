//! Field level diffs between task bodies.
//!
//! On the wire a diff is a plain JSON object where `null` means "delete this
//! key" and a nested object means "merge into this key". Inside the engine the
//! same information is a [`Diff`] of [`FieldChange`]s so merging and diffing
//! never have to guess between null and absent. Arrays are leaves: a changed
//! array is replaced whole.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{HubError, HubResult};

/// Stored form keeps `Set` of an object apart from `Nested`, which the wire
/// format cannot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "camelCase")]
pub enum FieldChange {
    #[default]
    Unchanged,
    Set(Value),
    Deleted,
    Nested(Diff),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Diff {
    fields: BTreeMap<String, FieldChange>,
}

static UNCHANGED: FieldChange = FieldChange::Unchanged;

impl Diff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn get(&self, key: &str) -> &FieldChange {
        self.fields.get(key).unwrap_or(&UNCHANGED)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldChange)> {
        self.fields.iter()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.insert(key, FieldChange::Set(value))
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.insert(key, FieldChange::Deleted)
    }

    pub fn nest(&mut self, key: impl Into<String>, diff: Diff) -> &mut Self {
        self.insert(key, FieldChange::Nested(diff))
    }

    pub fn insert(&mut self, key: impl Into<String>, change: FieldChange) -> &mut Self {
        match change {
            FieldChange::Unchanged => {
                self.fields.remove(&key.into());
            }
            other => {
                self.fields.insert(key.into(), other);
            }
        }
        self
    }

    pub fn remove(&mut self, key: &str) -> FieldChange {
        self.fields.remove(key).unwrap_or_default()
    }

    /// Drops the listed top level keys.
    pub fn without(mut self, keys: &[&str]) -> Self {
        for key in keys {
            self.fields.remove(*key);
        }
        self
    }

    /// Reads the wire format. The top level must be an object.
    pub fn from_wire(value: &Value) -> HubResult<Self> {
        match value {
            Value::Object(map) => Ok(Self::from_map(map)),
            Value::Null => Ok(Self::new()),
            other => Err(HubError::Protocol(format!(
                "diff must be an object, got {}",
                other
            ))),
        }
    }

    fn from_map(map: &Map<String, Value>) -> Self {
        let mut diff = Self::new();
        for (key, value) in map {
            let change = match value {
                Value::Null => FieldChange::Deleted,
                Value::Object(inner) => FieldChange::Nested(Self::from_map(inner)),
                other => FieldChange::Set(other.clone()),
            };
            diff.fields.insert(key.clone(), change);
        }
        diff
    }

    pub fn to_wire(&self) -> Value {
        let mut map = Map::new();
        for (key, change) in &self.fields {
            let value = match change {
                FieldChange::Unchanged => continue,
                FieldChange::Set(v) => v.clone(),
                FieldChange::Deleted => Value::Null,
                FieldChange::Nested(d) => d.to_wire(),
            };
            map.insert(key.clone(), value);
        }
        Value::Object(map)
    }

    /// Tree of `true` leaves marking every field this diff touches.
    pub fn modified_tree(&self) -> Option<Value> {
        let mut map = Map::new();
        for (key, change) in &self.fields {
            let marker = match change {
                FieldChange::Unchanged => None,
                FieldChange::Deleted => Some(Value::Bool(true)),
                FieldChange::Set(Value::Object(obj)) => {
                    leaf_tree(obj).or(Some(Value::Bool(true)))
                }
                FieldChange::Set(_) => Some(Value::Bool(true)),
                FieldChange::Nested(d) => d.modified_tree(),
            };
            if let Some(marker) = marker {
                map.insert(key.clone(), marker);
            }
        }
        if map.is_empty() {
            None
        } else {
            Some(Value::Object(map))
        }
    }

    /// Combines two diffs so that `merge(merge(b, self), other) == merge(b, self.then(other))`.
    pub fn then(mut self, other: &Diff) -> Self {
        for (key, change) in &other.fields {
            let combined = match (self.fields.remove(key), change) {
                (_, FieldChange::Unchanged) => continue,
                (Some(FieldChange::Nested(mine)), FieldChange::Nested(theirs)) => {
                    FieldChange::Nested(mine.then(theirs))
                }
                (Some(FieldChange::Set(prev)), FieldChange::Nested(theirs)) => {
                    let mut obj = match prev {
                        Value::Object(obj) => obj,
                        _ => Map::new(),
                    };
                    apply_to_map(&mut obj, theirs);
                    FieldChange::Set(Value::Object(obj))
                }
                (Some(FieldChange::Deleted), FieldChange::Nested(theirs)) => {
                    let mut obj = Map::new();
                    apply_to_map(&mut obj, theirs);
                    FieldChange::Set(Value::Object(obj))
                }
                (_, other) => other.clone(),
            };
            self.fields.insert(key.clone(), combined);
        }
        self
    }
}

fn leaf_tree(obj: &Map<String, Value>) -> Option<Value> {
    let mut map = Map::new();
    for (key, value) in obj {
        match value {
            Value::Null => {}
            Value::Object(inner) => {
                if let Some(tree) = leaf_tree(inner) {
                    map.insert(key.clone(), tree);
                }
            }
            _ => {
                map.insert(key.clone(), Value::Bool(true));
            }
        }
    }
    if map.is_empty() {
        None
    } else {
        Some(Value::Object(map))
    }
}

/// Removes object entries whose value is null, recursively.
pub fn prune_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, prune_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(prune_nulls).collect()),
        other => other,
    }
}

fn apply_to_map(map: &mut Map<String, Value>, diff: &Diff) {
    for (key, change) in &diff.fields {
        match change {
            FieldChange::Unchanged => {}
            FieldChange::Set(v) => {
                map.insert(key.clone(), prune_nulls(v.clone()));
            }
            FieldChange::Deleted => {
                map.remove(key);
            }
            FieldChange::Nested(inner) => {
                let slot = map
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !slot.is_object() {
                    *slot = Value::Object(Map::new());
                }
                if let Value::Object(obj) = slot {
                    apply_to_map(obj, inner);
                }
            }
        }
    }
}

/// Applies `diff` to `base` with last-write-wins per leaf.
pub fn merge_in_place(base: &mut Value, diff: &Diff) {
    if !base.is_object() {
        *base = Value::Object(Map::new());
    }
    if let Value::Object(map) = base {
        apply_to_map(map, diff);
    }
}

pub fn merge(base: &Value, diff: &Diff) -> Value {
    let mut out = base.clone();
    merge_in_place(&mut out, diff);
    out
}

/// Smallest diff that turns `old` into `new`. Non-object inputs count as empty objects.
pub fn diff(old: &Value, new: &Value) -> Diff {
    let empty = Map::new();
    let old_map = old.as_object().unwrap_or(&empty);
    let new_map = new.as_object().unwrap_or(&empty);
    diff_maps(old_map, new_map)
}

fn diff_maps(old: &Map<String, Value>, new: &Map<String, Value>) -> Diff {
    let mut out = Diff::new();
    for (key, new_value) in new {
        if new_value.is_null() {
            if old.get(key).is_some_and(|v| !v.is_null()) {
                out.fields.insert(key.clone(), FieldChange::Deleted);
            }
            continue;
        }
        match (old.get(key), new_value) {
            (Some(Value::Object(a)), Value::Object(b)) => {
                let inner = diff_maps(a, b);
                if !inner.is_empty() {
                    out.fields.insert(key.clone(), FieldChange::Nested(inner));
                }
            }
            (Some(old_value), _) if old_value == new_value => {}
            _ => {
                out.fields
                    .insert(key.clone(), FieldChange::Set(prune_nulls(new_value.clone())));
            }
        }
    }
    for (key, old_value) in old {
        if !new.contains_key(key) && !old_value.is_null() {
            out.fields.insert(key.clone(), FieldChange::Deleted);
        }
    }
    out
}
