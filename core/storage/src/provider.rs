//! Store trait definitions.

use async_trait::async_trait;
use serde_json::Value;

use tether_common::{EntityType, Result};

/// Durable storage for the engine's persisted snapshot.
///
/// A store holds opaque blobs keyed by namespace. The sync engine serializes
/// its operations, conflicts and last sync time into one blob and writes it at
/// every state-change boundary.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Get the store name (e.g., "memory", "local").
    fn name(&self) -> &str;

    /// Load the blob stored under `namespace`.
    ///
    /// # Returns
    /// `None` if nothing has been saved under the namespace yet.
    ///
    /// # Errors
    /// - Storage/I/O errors
    async fn load(&self, namespace: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the blob stored under `namespace`.
    ///
    /// # Postconditions
    /// - A subsequent `load` returns exactly `data`
    /// - A failed save leaves the previous blob intact
    async fn save(&self, namespace: &str, data: Vec<u8>) -> Result<()>;

    /// Remove the blob stored under `namespace`. Missing blobs are not an error.
    async fn clear(&self, namespace: &str) -> Result<()>;
}

/// The application's local persisted representation of entities.
///
/// The engine only ever writes through this trait: accepted payloads after a
/// successful push and resolved payloads after a conflict resolution. It never
/// reads local entities to make sync decisions.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Overwrite the local representation of an entity.
    ///
    /// Must be idempotent: applying the same payload twice leaves the same
    /// state as applying it once.
    async fn apply(&self, entity_type: &EntityType, entity_id: &str, payload: &Value)
        -> Result<()>;

    /// Remove the local representation of an entity. Missing entities are not
    /// an error.
    async fn remove(&self, entity_type: &EntityType, entity_id: &str) -> Result<()>;

    /// Read the local representation of an entity.
    async fn get(&self, entity_type: &EntityType, entity_id: &str) -> Result<Option<Value>>;
}

/// Validate an entity id before it is used as a storage key.
pub(crate) fn check_entity_id(entity_id: &str) -> Result<()> {
    if entity_id.is_empty() {
        return Err(tether_common::Error::InvalidInput(
            "Entity id cannot be empty".to_string(),
        ));
    }
    if entity_id.contains('/') || entity_id.contains('\\') || entity_id.starts_with('.') {
        return Err(tether_common::Error::InvalidInput(format!(
            "Entity id '{}' must be a single path component",
            entity_id
        )));
    }
    Ok(())
}
