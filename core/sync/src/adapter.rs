//! Entity sync adapters: the remote collaborator seam.
//!
//! Each entity type registers one adapter. An adapter maps a queued operation
//! to exactly one remote call and may supply its own merge function.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use tether_common::{EntityType, Error, Result};

use crate::queue::OperationKind;
use crate::strategy::suggest_merge;

/// Failure reported by a remote call.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// The remote rejected the push because its state diverged.
    #[error("Conflict: {message}")]
    Conflict {
        message: String,
        /// Authoritative remote payload.
        remote: Value,
    },

    /// Network or server hiccup, worth retrying.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The remote refused the payload itself.
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl AdapterError {
    /// Conflict carrying the remote payload.
    pub fn conflict(remote: Value) -> Self {
        Self::Conflict {
            message: "remote state diverged".to_string(),
            remote,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Remote payload attached to a conflict.
    pub fn remote_payload(&self) -> Option<&Value> {
        match self {
            Self::Conflict { remote, .. } => Some(remote),
            _ => None,
        }
    }
}

impl From<AdapterError> for Error {
    fn from(err: AdapterError) -> Self {
        Error::Adapter(err.to_string())
    }
}

/// Result type for remote calls.
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Remote API surface for one entity type.
///
/// Calls return the payload the server accepted, which may differ from the
/// one pushed (server-assigned fields, normalization).
#[async_trait]
pub trait EntitySyncAdapter: Send + Sync {
    /// Entity type served by this adapter.
    fn entity_type(&self) -> &EntityType;

    async fn create(&self, entity_id: &str, payload: &Value) -> AdapterResult<Value>;

    async fn update(&self, entity_id: &str, payload: &Value) -> AdapterResult<Value>;

    async fn delete(&self, entity_id: &str, payload: &Value) -> AdapterResult<Value>;

    /// Merge function used by `Merge` resolutions without a supplied payload.
    fn merge(&self, local: &Value, remote: &Value) -> Value {
        suggest_merge(local, remote)
    }
}

/// Issue the remote call matching an operation kind.
pub async fn dispatch(
    adapter: &dyn EntitySyncAdapter,
    kind: OperationKind,
    entity_id: &str,
    payload: &Value,
) -> AdapterResult<Value> {
    match kind {
        OperationKind::Create => adapter.create(entity_id, payload).await,
        OperationKind::Update => adapter.update(entity_id, payload).await,
        OperationKind::Delete => adapter.delete(entity_id, payload).await,
    }
}

/// Push a resolved payload over the remote copy.
///
/// The conflict proves the entity exists remotely, so creates are pushed as
/// updates. Deletes stay deletes.
pub async fn push_resolved(
    adapter: &dyn EntitySyncAdapter,
    kind: OperationKind,
    entity_id: &str,
    payload: &Value,
) -> AdapterResult<Value> {
    match kind {
        OperationKind::Delete => adapter.delete(entity_id, payload).await,
        OperationKind::Create | OperationKind::Update => adapter.update(entity_id, payload).await,
    }
}

/// Registry of adapters keyed by entity type.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<EntityType, Arc<dyn EntitySyncAdapter>>,
}

impl AdapterRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its entity type.
    ///
    /// # Errors
    /// - `AlreadyExists` if the entity type already has an adapter
    pub fn register(&mut self, adapter: Arc<dyn EntitySyncAdapter>) -> Result<()> {
        let entity_type = adapter.entity_type().clone();
        if self.adapters.contains_key(&entity_type) {
            return Err(Error::AlreadyExists(format!(
                "Adapter for '{}' is already registered",
                entity_type
            )));
        }
        self.adapters.insert(entity_type, adapter);
        Ok(())
    }

    /// Adapter for an entity type.
    pub fn get(&self, entity_type: &EntityType) -> Option<Arc<dyn EntitySyncAdapter>> {
        self.adapters.get(entity_type).cloned()
    }

    pub fn contains(&self, entity_type: &EntityType) -> bool {
        self.adapters.contains_key(entity_type)
    }

    /// Registered entity types, sorted.
    pub fn entity_types(&self) -> Vec<EntityType> {
        let mut types: Vec<_> = self.adapters.keys().cloned().collect();
        types.sort();
        types
    }
}
