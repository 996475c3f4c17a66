//! Push Update Strategies
//!
//! A push message's `type` selects an [`UpdateStrategy`] through a
//! [`StrategyMap`]. The strategy and the message data form a [`PushUpdate`],
//! which is applied to the current cache value by exhaustive match.
//!
//! # Merge semantics
//!
//! | current value            | result                                      |
//! |--------------------------|---------------------------------------------|
//! | absent / scalar          | replaced by the payload                     |
//! | array                    | items merged by identifier, unknown appended|
//! | object carrying an id    | shallow merge of the payload                |
//! | object keyed by id       | payload merged into `map[id]`               |

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::store::EntryUpdate;
use crate::domain::events::RemovalReason;
use crate::error::{Error, Result};

/// How a push payload is folded into the cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStrategy {
    Replace,
    Merge,
    Append,
    Prepend,
    /// Drop items whose identifier matches the payload
    Remove,
    /// Remove the key so the next read refetches
    Invalidate,
}

impl UpdateStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Merge => "merge",
            Self::Append => "append",
            Self::Prepend => "prepend",
            Self::Remove => "remove",
            Self::Invalidate => "invalidate",
        }
    }
}

impl std::fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "replace" => Ok(Self::Replace),
            "merge" => Ok(Self::Merge),
            "append" => Ok(Self::Append),
            "prepend" => Ok(Self::Prepend),
            "remove" => Ok(Self::Remove),
            "invalidate" => Ok(Self::Invalidate),
            other => Err(Error::Config(format!("unknown update strategy '{}'", other))),
        }
    }
}

/// Message type → strategy, with a fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyMap {
    by_type: HashMap<String, UpdateStrategy>,
    default: UpdateStrategy,
    dedup: bool,
}

impl StrategyMap {
    /// Every message type uses `default` until overridden with `on`.
    pub fn new(default: UpdateStrategy) -> Self {
        Self {
            by_type: HashMap::new(),
            default,
            dedup: true,
        }
    }

    pub fn on(mut self, message_type: impl Into<String>, strategy: UpdateStrategy) -> Self {
        self.by_type.insert(message_type.into(), strategy);
        self
    }

    /// Skip appended/prepended items whose identifier is already present
    /// (default on).
    pub fn with_dedup(mut self, dedup: bool) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn strategy_for(&self, message_type: &str) -> UpdateStrategy {
        self.by_type
            .get(message_type)
            .copied()
            .unwrap_or(self.default)
    }

    pub fn default_strategy(&self) -> UpdateStrategy {
        self.default
    }

    pub fn dedup(&self) -> bool {
        self.dedup
    }
}

impl From<UpdateStrategy> for StrategyMap {
    fn from(strategy: UpdateStrategy) -> Self {
        Self::new(strategy)
    }
}

/// Tagged push payload, one variant per strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum PushUpdate {
    Replace(Value),
    Merge(Value),
    Append(Vec<Value>),
    Prepend(Vec<Value>),
    /// Identifiers to drop
    Remove(Vec<Value>),
    Invalidate,
}

impl PushUpdate {
    /// Build the payload for `strategy` from message data.
    pub fn new(strategy: UpdateStrategy, data: Value, id_field: &str) -> Self {
        match strategy {
            UpdateStrategy::Replace => Self::Replace(data),
            UpdateStrategy::Merge => Self::Merge(data),
            UpdateStrategy::Append => Self::Append(into_items(data)),
            UpdateStrategy::Prepend => Self::Prepend(into_items(data)),
            UpdateStrategy::Remove => Self::Remove(
                into_items(data)
                    .into_iter()
                    .map(|item| match item.get(id_field) {
                        Some(id) => id.clone(),
                        None => item,
                    })
                    .collect(),
            ),
            UpdateStrategy::Invalidate => Self::Invalidate,
        }
    }

    pub fn strategy(&self) -> UpdateStrategy {
        match self {
            Self::Replace(_) => UpdateStrategy::Replace,
            Self::Merge(_) => UpdateStrategy::Merge,
            Self::Append(_) => UpdateStrategy::Append,
            Self::Prepend(_) => UpdateStrategy::Prepend,
            Self::Remove(_) => UpdateStrategy::Remove,
            Self::Invalidate => UpdateStrategy::Invalidate,
        }
    }

    /// Decide the store change for `current`.
    pub fn apply(
        self,
        key: &str,
        current: Option<&Value>,
        id_field: &str,
        dedup: bool,
    ) -> Result<EntryUpdate> {
        let strategy = self.strategy();
        let mismatch = |reason: &str| Error::UpdateMismatch {
            key: key.to_string(),
            strategy: strategy.to_string(),
            reason: reason.to_string(),
        };

        match (self, current) {
            (Self::Replace(data), _) => Ok(EntryUpdate::Write(data)),
            (Self::Invalidate, _) => Ok(EntryUpdate::Remove(RemovalReason::Invalidated)),

            (Self::Merge(patch), None) => Ok(EntryUpdate::Write(patch)),
            (Self::Merge(patch), Some(Value::Array(items))) => {
                let mut items = items.clone();
                for item in into_items(patch) {
                    merge_into_sequence(&mut items, item, id_field)
                        .map_err(|reason| mismatch(reason))?;
                }
                Ok(EntryUpdate::Write(Value::Array(items)))
            }
            (Self::Merge(patch), Some(Value::Object(map))) => {
                let mut map = map.clone();
                merge_into_object(&mut map, patch, id_field).map_err(|reason| mismatch(reason))?;
                Ok(EntryUpdate::Write(Value::Object(map)))
            }
            (Self::Merge(patch), Some(_)) => Ok(EntryUpdate::Write(patch)),

            (Self::Append(new_items), None) | (Self::Prepend(new_items), None) => {
                Ok(EntryUpdate::Write(Value::Array(new_items)))
            }
            (Self::Append(new_items), Some(Value::Array(items))) => {
                let mut items = items.clone();
                let fresh = unseen(&items, new_items, id_field, dedup);
                items.extend(fresh);
                Ok(EntryUpdate::Write(Value::Array(items)))
            }
            (Self::Prepend(new_items), Some(Value::Array(items))) => {
                let mut combined = unseen(items, new_items, id_field, dedup);
                combined.extend(items.iter().cloned());
                Ok(EntryUpdate::Write(Value::Array(combined)))
            }
            (Self::Append(_), Some(_)) | (Self::Prepend(_), Some(_)) => {
                Err(mismatch("cached value is not a sequence"))
            }

            (Self::Remove(_), None) => Ok(EntryUpdate::Keep),
            (Self::Remove(ids), Some(Value::Array(items))) => {
                let kept: Vec<Value> = items
                    .iter()
                    .filter(|item| !item.get(id_field).is_some_and(|id| ids.contains(id)))
                    .cloned()
                    .collect();
                if kept.len() == items.len() {
                    return Ok(EntryUpdate::Keep);
                }
                Ok(EntryUpdate::Write(Value::Array(kept)))
            }
            (Self::Remove(ids), Some(Value::Object(map))) => {
                let mut map = map.clone();
                let before = map.len();
                for id in &ids {
                    map.remove(&id_key(id));
                }
                if map.len() == before {
                    return Ok(EntryUpdate::Keep);
                }
                Ok(EntryUpdate::Write(Value::Object(map)))
            }
            (Self::Remove(_), Some(_)) => Err(mismatch("cached value is not a collection")),
        }
    }
}

fn into_items(data: Value) -> Vec<Value> {
    match data {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Map key for an identifier value: strings verbatim, anything else as JSON.
fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn shallow_merge(target: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (field, value) in patch {
        target.insert(field, value);
    }
}

fn merge_into_sequence(
    items: &mut Vec<Value>,
    patch: Value,
    id_field: &str,
) -> std::result::Result<(), &'static str> {
    let Value::Object(patch) = patch else {
        return Err("merge payload for a sequence must be an object");
    };
    let Some(id) = patch.get(id_field).cloned() else {
        return Err("merge payload has no identifier");
    };

    match items.iter_mut().find(|item| item.get(id_field) == Some(&id)) {
        Some(Value::Object(existing)) => shallow_merge(existing, patch),
        Some(other) => *other = Value::Object(patch),
        None => items.push(Value::Object(patch)),
    }
    Ok(())
}

fn merge_into_object(
    map: &mut Map<String, Value>,
    patch: Value,
    id_field: &str,
) -> std::result::Result<(), &'static str> {
    let Value::Object(patch) = patch else {
        return Err("merge payload for an object must be an object");
    };

    // A single record: merge fields directly
    if map.contains_key(id_field) || !patch.contains_key(id_field) {
        shallow_merge(map, patch);
        return Ok(());
    }

    // A keyed collection: merge into map[id]
    let slot = id_key(&patch[id_field]);
    match map.get_mut(&slot) {
        Some(Value::Object(existing)) => shallow_merge(existing, patch),
        _ => {
            map.insert(slot, Value::Object(patch));
        }
    }
    Ok(())
}

/// New items whose identifier is not already present (all items when
/// `dedup` is off or an item has no identifier).
fn unseen(existing: &[Value], new_items: Vec<Value>, id_field: &str, dedup: bool) -> Vec<Value> {
    if !dedup {
        return new_items;
    }
    let mut seen: Vec<Value> = existing
        .iter()
        .filter_map(|item| item.get(id_field).cloned())
        .collect();
    new_items
        .into_iter()
        .filter(|item| match item.get(id_field) {
            Some(id) if seen.contains(id) => false,
            Some(id) => {
                seen.push(id.clone());
                true
            }
            None => true,
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
