//! Conflict records and the store that keeps them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use tether_common::{ConflictId, EntityType, OperationId};

use crate::queue::OperationKind;

/// How a conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    /// Keep the local payload, push it over the remote.
    Local,
    /// Keep the remote payload, pull it over the local copy.
    Remote,
    /// Combine both payloads and write the result to both sides.
    Merge,
    /// Use a caller-supplied payload on both sides.
    Manual,
}

impl std::str::FromStr for Resolution {
    type Err = tether_common::Error;

    fn from_str(s: &str) -> tether_common::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            "merge" => Ok(Self::Merge),
            "manual" => Ok(Self::Manual),
            _ => Err(tether_common::Error::InvalidInput(format!(
                "Unknown resolution '{}', expected local, remote, merge or manual",
                s
            ))),
        }
    }
}

/// A detected divergence between the local and remote copy of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: ConflictId,
    /// Kind of the rejected operation.
    pub kind: OperationKind,
    pub entity_type: EntityType,
    pub entity_id: String,
    /// Payload we tried to push.
    pub local_payload: Value,
    /// Authoritative payload reported by the remote.
    pub remote_payload: Value,
    pub detected_at: DateTime<Utc>,
    /// Operation whose push was rejected, if the conflict came from a drain.
    #[serde(default)]
    pub operation_id: Option<OperationId>,
    pub resolution: Option<Resolution>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Final payload written by the resolution.
    #[serde(default)]
    pub resolved_payload: Option<Value>,
}

impl Conflict {
    /// Create a new unresolved conflict.
    pub fn new(
        id: ConflictId,
        kind: OperationKind,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        local_payload: Value,
        remote_payload: Value,
    ) -> Self {
        Self {
            id,
            kind,
            entity_type,
            entity_id: entity_id.into(),
            local_payload,
            remote_payload,
            detected_at: Utc::now(),
            operation_id: None,
            resolution: None,
            resolved_at: None,
            resolved_payload: None,
        }
    }

    /// Link the conflict to the operation that triggered it.
    pub fn with_operation(mut self, operation_id: OperationId) -> Self {
        self.operation_id = Some(operation_id);
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    /// Record the resolution.
    ///
    /// Returns `false` and changes nothing if the conflict was already
    /// resolved; resolution, payload and timestamp are always set together.
    pub fn mark_resolved(
        &mut self,
        resolution: Resolution,
        payload: Value,
        now: DateTime<Utc>,
    ) -> bool {
        if self.is_resolved() {
            return false;
        }
        self.resolution = Some(resolution);
        self.resolved_payload = Some(payload);
        self.resolved_at = Some(now);
        true
    }
}

/// Conflicts in detection order. Resolved conflicts are retained for history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConflictStore {
    conflicts: Vec<Conflict>,
}

impl ConflictStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from persisted conflicts, keeping their order.
    pub fn from_conflicts(conflicts: Vec<Conflict>) -> Self {
        Self { conflicts }
    }

    /// Append a newly detected conflict.
    pub fn push(&mut self, conflict: Conflict) {
        self.conflicts.push(conflict);
    }

    pub fn get(&self, id: ConflictId) -> Option<&Conflict> {
        self.conflicts.iter().find(|c| c.id == id)
    }

    pub fn get_mut(&mut self, id: ConflictId) -> Option<&mut Conflict> {
        self.conflicts.iter_mut().find(|c| c.id == id)
    }

    /// Unresolved conflicts in detection order.
    pub fn unresolved(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|c| !c.is_resolved())
    }

    pub fn unresolved_ids(&self) -> Vec<ConflictId> {
        self.unresolved().map(|c| c.id).collect()
    }

    pub fn unresolved_count(&self) -> usize {
        self.unresolved().count()
    }

    /// Operations that must not be retried until their conflict is resolved.
    pub fn blocked_operations(&self) -> HashSet<OperationId> {
        self.unresolved().filter_map(|c| c.operation_id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter()
    }

    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Largest id in the store, if any.
    pub fn max_id(&self) -> Option<ConflictId> {
        self.conflicts.iter().map(|c| c.id).max()
    }
}
