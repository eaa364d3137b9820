//! Engine state snapshot and persistence layout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tether_common::{Error, Result};

use crate::conflict::{Conflict, ConflictStore};
use crate::queue::{Operation, OperationQueue, OperationStatus};

/// Overall status of the sync orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SyncStatus {
    /// No pass running and nothing to report.
    #[default]
    Idle,
    /// A pass is draining the queue.
    Syncing,
    /// Last pass finished without engine errors or open conflicts.
    Success,
    /// Last pass aborted on an engine-level failure.
    Error,
    /// Unresolved conflicts are waiting for a decision.
    Conflict,
}

impl SyncStatus {
    /// Outcome of a finished pass, kept until the next pass starts.
    pub fn is_outcome(self) -> bool {
        matches!(self, SyncStatus::Success | SyncStatus::Error | SyncStatus::Conflict)
    }
}

/// The aggregate root owned by the sync engine.
///
/// Observers only ever see complete snapshots: the engine clones the current
/// state, mutates the clone and publishes it as a new `Arc<EngineState>`.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineState {
    /// Operations in enqueue order.
    pub operations: OperationQueue,
    /// Conflicts in detection order.
    pub conflicts: ConflictStore,
    pub is_online: bool,
    pub sync_status: SyncStatus,
    /// Percentage of the current pass processed.
    pub progress: u8,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Message of the engine-level failure behind `SyncStatus::Error`.
    pub last_error: Option<String>,
    next_sequence: u64,
}

impl EngineState {
    /// Create an empty state.
    pub fn new(is_online: bool) -> Self {
        Self {
            operations: OperationQueue::new(),
            conflicts: ConflictStore::new(),
            is_online,
            sync_status: SyncStatus::Idle,
            progress: 0,
            last_sync_at: None,
            last_error: None,
            next_sequence: 1,
        }
    }

    /// Restore from persisted data. Transient fields start at Idle/0.
    pub fn from_persisted(persisted: PersistedState, is_online: bool) -> Self {
        let operations = OperationQueue::from_operations(persisted.operations);
        let conflicts = ConflictStore::from_conflicts(persisted.conflicts);

        let highest = operations
            .max_id()
            .map(|id| id.get())
            .into_iter()
            .chain(conflicts.max_id().map(|id| id.get()))
            .max()
            .unwrap_or(0);

        Self {
            operations,
            conflicts,
            is_online,
            sync_status: SyncStatus::Idle,
            progress: 0,
            last_sync_at: persisted.last_sync_at,
            last_error: None,
            next_sequence: persisted.next_sequence.max(highest + 1),
        }
    }

    /// Durable subset of the state.
    pub fn to_persisted(&self) -> PersistedState {
        PersistedState {
            operations: self.operations.iter().cloned().collect(),
            conflicts: self.conflicts.iter().cloned().collect(),
            last_sync_at: self.last_sync_at,
            next_sequence: self.next_sequence,
        }
    }

    /// Allocate the next id in the shared operation/conflict sequence.
    pub fn next_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    /// Whether a drain would find anything to push.
    pub fn has_work(&self, include_failed: bool) -> bool {
        let blocked = self.conflicts.blocked_operations();
        self.operations.iter().any(|op| {
            op.is_pending()
                || (include_failed
                    && op.status == OperationStatus::Failed
                    && !blocked.contains(&op.id))
        })
    }

    /// Counts for dashboards.
    pub fn metrics(&self) -> SyncMetrics {
        SyncMetrics {
            pending: self.operations.count_with_status(OperationStatus::Pending),
            failed: self.operations.count_with_status(OperationStatus::Failed),
            abandoned: self.operations.count_with_status(OperationStatus::Abandoned),
            completed: self.operations.count_with_status(OperationStatus::Completed),
            unresolved_conflicts: self.conflicts.unresolved_count(),
            last_sync_at: self.last_sync_at,
        }
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Persisted layout: `{ operations, conflicts, lastSyncAt, nextSequence }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub operations: Vec<Operation>,
    pub conflicts: Vec<Conflict>,
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_sequence: u64,
}

impl PersistedState {
    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON bytes.
    pub fn from_json(json: &[u8]) -> Result<Self> {
        serde_json::from_slice(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Operation and conflict counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetrics {
    pub pending: usize,
    pub failed: usize,
    pub abandoned: usize,
    pub completed: usize,
    pub unresolved_conflicts: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
}
