//! Loopback remote backed by a directory next to the local state.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use tether_common::EntityType;
use tether_storage::LocalStore;
use tether_sync::{AdapterError, AdapterResult, EntitySyncAdapter};

/// Remote that stores accepted payloads in a [`LocalStore`].
///
/// Creating an entity that already exists is reported as a conflict carrying
/// the stored copy; updating a missing one is rejected.
pub struct LoopbackAdapter {
    entity_type: EntityType,
    remote: Arc<dyn LocalStore>,
}

impl LoopbackAdapter {
    pub fn new(entity_type: EntityType, remote: Arc<dyn LocalStore>) -> Self {
        Self {
            entity_type,
            remote,
        }
    }

    async fn stored(&self, entity_id: &str) -> AdapterResult<Option<Value>> {
        self.remote
            .get(&self.entity_type, entity_id)
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))
    }

    async fn store(&self, entity_id: &str, payload: &Value) -> AdapterResult<Value> {
        self.remote
            .apply(&self.entity_type, entity_id, payload)
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))?;
        Ok(payload.clone())
    }
}

#[async_trait]
impl EntitySyncAdapter for LoopbackAdapter {
    fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    async fn create(&self, entity_id: &str, payload: &Value) -> AdapterResult<Value> {
        match self.stored(entity_id).await? {
            Some(existing) if existing != *payload => Err(AdapterError::conflict(existing)),
            _ => self.store(entity_id, payload).await,
        }
    }

    async fn update(&self, entity_id: &str, payload: &Value) -> AdapterResult<Value> {
        if self.stored(entity_id).await?.is_none() {
            return Err(AdapterError::Rejected(format!(
                "{} {} does not exist remotely",
                self.entity_type, entity_id
            )));
        }
        self.store(entity_id, payload).await
    }

    async fn delete(&self, entity_id: &str, _payload: &Value) -> AdapterResult<Value> {
        self.remote
            .remove(&self.entity_type, entity_id)
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))?;
        Ok(Value::Null)
    }
}
