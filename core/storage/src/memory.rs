//! In-memory store for testing.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::provider::{check_entity_id, LocalStore, StateStore};
use tether_common::{EntityType, Error, Result};

type EntityKey = (EntityType, String);

/// In-memory store implementing both [`StateStore`] and [`LocalStore`].
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. Clones share the same underlying maps.
#[derive(Clone, Default)]
pub struct MemoryStore {
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    entities: Arc<RwLock<HashMap<EntityKey, Value>>>,
    read_only: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save` fail with a storage error.
    ///
    /// Simulates a full disk or revoked quota.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Number of local entities currently stored.
    pub fn entity_count(&self) -> Result<usize> {
        Ok(self.entities_read()?.len())
    }

    fn blobs_read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Vec<u8>>>> {
        self.blobs
            .read()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))
    }

    fn blobs_write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Vec<u8>>>> {
        self.blobs
            .write()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))
    }

    fn entities_read(&self) -> Result<RwLockReadGuard<'_, HashMap<EntityKey, Value>>> {
        self.entities
            .read()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))
    }

    fn entities_write(&self) -> Result<RwLockWriteGuard<'_, HashMap<EntityKey, Value>>> {
        self.entities
            .write()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load(&self, namespace: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs_read()?.get(namespace).cloned())
    }

    async fn save(&self, namespace: &str, data: Vec<u8>) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!(
                "Memory store is read-only, cannot save '{}'",
                namespace
            )));
        }
        debug!("Saving {} bytes under '{}'", data.len(), namespace);
        self.blobs_write()?.insert(namespace.to_string(), data);
        Ok(())
    }

    async fn clear(&self, namespace: &str) -> Result<()> {
        self.blobs_write()?.remove(namespace);
        Ok(())
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn apply(
        &self,
        entity_type: &EntityType,
        entity_id: &str,
        payload: &Value,
    ) -> Result<()> {
        check_entity_id(entity_id)?;
        self.entities_write()?
            .insert((entity_type.clone(), entity_id.to_string()), payload.clone());
        Ok(())
    }

    async fn remove(&self, entity_type: &EntityType, entity_id: &str) -> Result<()> {
        self.entities_write()?
            .remove(&(entity_type.clone(), entity_id.to_string()));
        Ok(())
    }

    async fn get(&self, entity_type: &EntityType, entity_id: &str) -> Result<Option<Value>> {
        Ok(self
            .entities_read()?
            .get(&(entity_type.clone(), entity_id.to_string()))
            .cloned())
    }
}
