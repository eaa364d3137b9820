//! Resolution strategies: which side wins and what the final payload is.
//!
//! Everything here is pure. Applying the result to the remote and local sides
//! is the engine's job.

use serde_json::{Map, Value};

use tether_common::{Error, Result};

use crate::conflict::{Conflict, Resolution};

/// Where a resolved payload must be written, and what it is.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionPlan {
    /// Final payload.
    pub payload: Value,
    /// Push the payload to the remote.
    pub apply_remote: bool,
    /// Write the payload into the local store.
    pub apply_local: bool,
}

impl Resolution {
    /// Whether this resolution writes to the remote side.
    pub fn applies_remote(self) -> bool {
        !matches!(self, Resolution::Remote)
    }

    /// Whether this resolution writes to the local side.
    pub fn applies_local(self) -> bool {
        !matches!(self, Resolution::Local)
    }
}

/// Compute the final payload for a conflict.
///
/// # Arguments
/// * `supplied` - caller payload; optional for `Merge`, required for `Manual`,
///   ignored for `Local` and `Remote`
/// * `merge` - merge function for the conflict's entity type, used by `Merge`
///   when nothing is supplied
///
/// # Errors
/// - `InvalidInput` if `Manual` is requested without a payload
pub fn plan<F>(
    conflict: &Conflict,
    resolution: Resolution,
    supplied: Option<Value>,
    merge: F,
) -> Result<ResolutionPlan>
where
    F: FnOnce(&Value, &Value) -> Value,
{
    let payload = match resolution {
        Resolution::Local => conflict.local_payload.clone(),
        Resolution::Remote => conflict.remote_payload.clone(),
        Resolution::Merge => match supplied {
            Some(payload) => payload,
            None => merge(&conflict.local_payload, &conflict.remote_payload),
        },
        Resolution::Manual => supplied.ok_or_else(|| {
            Error::InvalidInput(format!(
                "Manual resolution of {} requires a payload",
                conflict.id
            ))
        })?,
    };

    Ok(ResolutionPlan {
        payload,
        apply_remote: resolution.applies_remote(),
        apply_local: resolution.applies_local(),
    })
}

/// Default merge heuristic.
///
/// Starts from `remote` and overlays `local` field by field:
/// - list fields are unioned, remote items first, duplicates dropped
/// - object fields are shallow-merged, local keys win
/// - everything else takes the local value
///
/// If either side is not an object, `local` wins outright.
pub fn suggest_merge(local: &Value, remote: &Value) -> Value {
    let (Value::Object(local_fields), Value::Object(remote_fields)) = (local, remote) else {
        return local.clone();
    };

    let mut merged = remote_fields.clone();
    for (key, local_value) in local_fields {
        let value = match (merged.get(key), local_value) {
            (Some(Value::Array(remote_items)), Value::Array(local_items)) => {
                Value::Array(union(remote_items, local_items))
            }
            (Some(Value::Object(remote_map)), Value::Object(local_map)) => {
                Value::Object(overlay(remote_map, local_map))
            }
            _ => local_value.clone(),
        };
        merged.insert(key.clone(), value);
    }

    Value::Object(merged)
}

fn union(first: &[Value], second: &[Value]) -> Vec<Value> {
    let mut items: Vec<Value> = Vec::with_capacity(first.len() + second.len());
    for item in first.iter().chain(second) {
        if !items.contains(item) {
            items.push(item.clone());
        }
    }
    items
}

fn overlay(base: &Map<String, Value>, top: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in top {
        merged.insert(key.clone(), value.clone());
    }
    merged
}
