//! Structural diff between two documents.
//!
//! Each differing leaf becomes a [`ChangeRecord`] addressed by a
//! dot-separated field path:
//!
//! ```text
//! title                   document title
//! doc_type                activity kind
//! body                    whole body (shape change or text edit)
//! body.<key>.<sub>        object fields, recursively
//! body.<entity id>.<key>  entity fields (entities matched by id)
//! body.$order             entity order changed, same id set
//! ```
//!
//! Objects recurse key by key. Arrays nested inside values are compared
//! index by index. Everything else is a `replace`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

use crate::{ContentBody, Document, Entity};

/// Path of the synthetic entity-order change.
pub const ORDER_PATH: &str = "body.$order";

/// Kind of structural change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Add,
    Remove,
    Replace,
}

/// A single structural diff unit between two versions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub path: String,
    pub op: ChangeOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

impl ChangeRecord {
    fn add(path: String, value: Value) -> Self {
        Self {
            path,
            op: ChangeOp::Add,
            old_value: None,
            new_value: Some(value),
        }
    }

    fn remove(path: String, value: Value) -> Self {
        Self {
            path,
            op: ChangeOp::Remove,
            old_value: Some(value),
            new_value: None,
        }
    }

    fn replace(path: String, old: Value, new: Value) -> Self {
        Self {
            path,
            op: ChangeOp::Replace,
            old_value: Some(old),
            new_value: Some(new),
        }
    }
}

/// Join a parent path and a key.
pub fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Compute every change needed to turn `old` into `new`.
pub fn diff_documents(old: &Document, new: &Document) -> Vec<ChangeRecord> {
    let mut changes = Vec::new();

    if old.doc_type != new.doc_type {
        changes.push(ChangeRecord::replace(
            "doc_type".into(),
            to_value(&old.doc_type),
            to_value(&new.doc_type),
        ));
    }

    match (&old.title, &new.title) {
        (None, Some(t)) => changes.push(ChangeRecord::add("title".into(), Value::from(t.as_str()))),
        (Some(t), None) => {
            changes.push(ChangeRecord::remove("title".into(), Value::from(t.as_str())))
        }
        (Some(a), Some(b)) if a != b => changes.push(ChangeRecord::replace(
            "title".into(),
            Value::from(a.as_str()),
            Value::from(b.as_str()),
        )),
        _ => {}
    }

    match (&old.body, &new.body) {
        (ContentBody::Entities(a), ContentBody::Entities(b)) => diff_entities(a, b, &mut changes),
        (ContentBody::Fields(a), ContentBody::Fields(b)) => {
            let a = Value::Object(a.clone().into_iter().collect());
            let b = Value::Object(b.clone().into_iter().collect());
            diff_values(&a, &b, "body", &mut changes);
        }
        (ContentBody::Text(a), ContentBody::Text(b)) => {
            if a != b {
                changes.push(ChangeRecord::replace(
                    "body".into(),
                    Value::from(a.as_str()),
                    Value::from(b.as_str()),
                ));
            }
        }
        (a, b) => changes.push(ChangeRecord::replace("body".into(), to_value(a), to_value(b))),
    }

    changes
}

fn diff_entities(old: &[Entity], new: &[Entity], changes: &mut Vec<ChangeRecord>) {
    let old_by_id: HashMap<&str, &Entity> = old.iter().map(|e| (e.id.as_str(), e)).collect();
    let new_by_id: HashMap<&str, &Entity> = new.iter().map(|e| (e.id.as_str(), e)).collect();

    for entity in old {
        let path = join_path("body", &entity.id);
        match new_by_id.get(entity.id.as_str()) {
            Some(updated) => {
                diff_values(&entity.fields_value(), &updated.fields_value(), &path, changes)
            }
            None => changes.push(ChangeRecord::remove(path, entity.fields_value())),
        }
    }
    for entity in new {
        if !old_by_id.contains_key(entity.id.as_str()) {
            changes.push(ChangeRecord::add(
                join_path("body", &entity.id),
                entity.fields_value(),
            ));
        }
    }

    // Same id set, different order: record the reorder explicitly.
    let old_ids: Vec<&str> = old.iter().map(|e| e.id.as_str()).collect();
    let new_ids: Vec<&str> = new.iter().map(|e| e.id.as_str()).collect();
    let old_set: BTreeSet<&str> = old_ids.iter().copied().collect();
    let new_set: BTreeSet<&str> = new_ids.iter().copied().collect();
    if old_set == new_set && old_ids != new_ids {
        changes.push(ChangeRecord::replace(
            ORDER_PATH.into(),
            Value::from(old_ids),
            Value::from(new_ids),
        ));
    }
}

/// Recursive structural comparison of two JSON values rooted at `path`.
pub fn diff_values(old: &Value, new: &Value, path: &str, changes: &mut Vec<ChangeRecord>) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            for key in keys {
                let child = join_path(path, key);
                match (a.get(key), b.get(key)) {
                    (None, Some(v)) => changes.push(ChangeRecord::add(child, v.clone())),
                    (Some(v), None) => changes.push(ChangeRecord::remove(child, v.clone())),
                    (Some(x), Some(y)) => diff_values(x, y, &child, changes),
                    (None, None) => {}
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            for i in 0..a.len().max(b.len()) {
                let child = join_path(path, &i.to_string());
                match (a.get(i), b.get(i)) {
                    (None, Some(v)) => changes.push(ChangeRecord::add(child, v.clone())),
                    (Some(v), None) => changes.push(ChangeRecord::remove(child, v.clone())),
                    (Some(x), Some(y)) => diff_values(x, y, &child, changes),
                    (None, None) => {}
                }
            }
        }
        _ => changes.push(ChangeRecord::replace(path.to_string(), old.clone(), new.clone())),
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
