//! Operation queue: ordered pending/failed/completed local mutations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use tether_common::{EntityType, Error, OperationId, Result};

/// Kind of local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Entity created locally.
    Create,
    /// Existing entity modified locally.
    Update,
    /// Entity deleted locally.
    Delete,
}

/// Lifecycle status of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Waiting to be pushed.
    Pending,
    /// Accepted by the remote. Terminal until cleared.
    Completed,
    /// Last push attempt failed.
    Failed,
    /// Gave up after the configured number of attempts.
    Abandoned,
}

/// A queued local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Unique, generation-ordered identifier.
    pub id: OperationId,
    /// Kind of mutation.
    pub kind: OperationKind,
    /// Entity type, selects the adapter.
    pub entity_type: EntityType,
    /// Entity identifier.
    pub entity_id: String,
    /// Opaque payload pushed to the remote.
    pub payload: Value,
    /// When the operation was enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// Number of failed push attempts.
    pub retry_count: u32,
    /// Time of the last failure or explicit retry.
    pub last_retry_at: Option<DateTime<Utc>>,
    /// Current status.
    pub status: OperationStatus,
    /// Message of the most recent failure.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Earliest time an automatic retry may re-queue this operation.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl Operation {
    /// Create a new pending operation.
    pub fn new(
        id: OperationId,
        kind: OperationKind,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id,
            kind,
            entity_type,
            entity_id: entity_id.into(),
            payload,
            enqueued_at: Utc::now(),
            retry_count: 0,
            last_retry_at: None,
            status: OperationStatus::Pending,
            last_error: None,
            next_attempt_at: None,
        }
    }

    /// Whether the operation is waiting to be pushed.
    pub fn is_pending(&self) -> bool {
        self.status == OperationStatus::Pending
    }

    /// Mark a pending operation as accepted by the remote.
    pub fn mark_completed(&mut self) -> Result<()> {
        if self.status != OperationStatus::Pending {
            return Err(Error::InvalidState(format!(
                "Operation {} is {:?}, only pending operations can complete",
                self.id, self.status
            )));
        }
        self.status = OperationStatus::Completed;
        self.last_error = None;
        self.next_attempt_at = None;
        Ok(())
    }

    /// Record a failed push attempt.
    ///
    /// Increments `retry_count` by exactly one. When `max_attempts` is set and
    /// reached, the operation is abandoned instead of failed.
    pub fn mark_failed(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
        next_attempt_at: Option<DateTime<Utc>>,
        max_attempts: Option<u32>,
    ) {
        self.retry_count += 1;
        self.last_retry_at = Some(now);
        self.last_error = Some(error.into());

        if max_attempts.is_some_and(|max| self.retry_count >= max) {
            self.status = OperationStatus::Abandoned;
            self.next_attempt_at = None;
        } else {
            self.status = OperationStatus::Failed;
            self.next_attempt_at = next_attempt_at;
        }
    }

    /// Move a failed or abandoned operation back to pending.
    ///
    /// `retry_count` is left untouched.
    pub fn mark_retry(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            OperationStatus::Failed | OperationStatus::Abandoned => {
                self.status = OperationStatus::Pending;
                self.last_retry_at = Some(now);
                self.next_attempt_at = None;
                Ok(())
            }
            status => Err(Error::InvalidState(format!(
                "Operation {} is {:?}, only failed operations can be retried",
                self.id, status
            ))),
        }
    }
}

/// Ordered collection of operations, oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationQueue {
    operations: Vec<Operation>,
}

impl OperationQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a queue from persisted operations, keeping their order.
    pub fn from_operations(operations: Vec<Operation>) -> Self {
        Self { operations }
    }

    /// Append an operation at the back of the queue.
    pub fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    pub fn get(&self, id: OperationId) -> Option<&Operation> {
        self.operations.iter().find(|op| op.id == id)
    }

    pub fn get_mut(&mut self, id: OperationId) -> Option<&mut Operation> {
        self.operations.iter_mut().find(|op| op.id == id)
    }

    /// Remove an operation regardless of its status.
    pub fn remove(&mut self, id: OperationId) -> Result<Operation> {
        let index = self
            .operations
            .iter()
            .position(|op| op.id == id)
            .ok_or_else(|| Error::NotFound(format!("Operation {} not found", id)))?;
        Ok(self.operations.remove(index))
    }

    /// Reset a failed operation to pending.
    pub fn retry(&mut self, id: OperationId, now: DateTime<Utc>) -> Result<()> {
        self.get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Operation {} not found", id)))?
            .mark_retry(now)
    }

    /// Drop every completed operation, returning how many were removed.
    pub fn clear_completed(&mut self) -> usize {
        let before = self.operations.len();
        self.operations
            .retain(|op| op.status != OperationStatus::Completed);
        before - self.operations.len()
    }

    /// Ids of pending operations in enqueue order.
    pub fn pending_ids(&self) -> Vec<OperationId> {
        self.operations
            .iter()
            .filter(|op| op.is_pending())
            .map(|op| op.id)
            .collect()
    }

    /// Re-queue failed operations whose backoff has elapsed.
    ///
    /// Operations in `blocked` (waiting on a conflict resolution) stay failed.
    pub fn requeue_due(
        &mut self,
        now: DateTime<Utc>,
        blocked: &HashSet<OperationId>,
    ) -> Vec<OperationId> {
        let mut requeued = Vec::new();
        for op in &mut self.operations {
            if op.status != OperationStatus::Failed || blocked.contains(&op.id) {
                continue;
            }
            if op.next_attempt_at.is_some_and(|at| at > now) {
                continue;
            }
            if op.mark_retry(now).is_ok() {
                requeued.push(op.id);
            }
        }
        requeued
    }

    /// Earliest automatic retry time among failed, unblocked operations.
    pub fn next_retry_at(&self, blocked: &HashSet<OperationId>) -> Option<DateTime<Utc>> {
        self.operations
            .iter()
            .filter(|op| op.status == OperationStatus::Failed && !blocked.contains(&op.id))
            .filter_map(|op| op.next_attempt_at)
            .min()
    }

    /// Number of operations with the given status.
    pub fn count_with_status(&self, status: OperationStatus) -> usize {
        self.operations.iter().filter(|op| op.status == status).count()
    }

    /// Iterate in enqueue order.
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.operations.iter()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Largest id in the queue, if any.
    pub fn max_id(&self) -> Option<OperationId> {
        self.operations.iter().map(|op| op.id).max()
    }
}
