//! Local filesystem store.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::provider::{check_entity_id, LocalStore, StateStore};
use tether_common::{EntityType, Error, Result};

/// Local filesystem store implementing both [`StateStore`] and [`LocalStore`].
///
/// Layout under the root directory:
///
/// ```text
/// <root>/state/<namespace>.json
/// <root>/entities/<entity_type>/<entity_id>.json
/// ```
///
/// Every write goes to a temporary sibling file first and is renamed into
/// place, so a crash mid-write never leaves a truncated snapshot behind.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a new file store with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Invalid path
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_path(&self, namespace: &str) -> Result<PathBuf> {
        if namespace.is_empty() || namespace.contains('/') || namespace.contains('\\') {
            return Err(Error::InvalidInput(format!(
                "Invalid state namespace '{}'",
                namespace
            )));
        }
        Ok(self.root.join("state").join(format!("{}.json", namespace)))
    }

    fn entity_path(&self, entity_type: &EntityType, entity_id: &str) -> Result<PathBuf> {
        check_entity_id(entity_id)?;
        Ok(self
            .root
            .join("entities")
            .join(entity_type.as_str())
            .join(format!("{}.json", entity_id)))
    }

    async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::InvalidInput(format!("No parent for {}", path.display())))?;
        fs::create_dir_all(parent).await?;

        let tmp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&tmp, data).await?;
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(Error::Io(e));
        }
        Ok(())
    }

    async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn remove_optional(path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[async_trait]
impl StateStore for FileStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn load(&self, namespace: &str) -> Result<Option<Vec<u8>>> {
        let path = self.state_path(namespace)?;
        Self::read_optional(&path).await
    }

    async fn save(&self, namespace: &str, data: Vec<u8>) -> Result<()> {
        let path = self.state_path(namespace)?;
        debug!("Writing {} bytes to {}", data.len(), path.display());
        Self::write_atomic(&path, &data).await
    }

    async fn clear(&self, namespace: &str) -> Result<()> {
        let path = self.state_path(namespace)?;
        Self::remove_optional(&path).await
    }
}

#[async_trait]
impl LocalStore for FileStore {
    async fn apply(
        &self,
        entity_type: &EntityType,
        entity_id: &str,
        payload: &Value,
    ) -> Result<()> {
        let path = self.entity_path(entity_type, entity_id)?;
        let json = serde_json::to_vec_pretty(payload)?;
        Self::write_atomic(&path, &json).await
    }

    async fn remove(&self, entity_type: &EntityType, entity_id: &str) -> Result<()> {
        let path = self.entity_path(entity_type, entity_id)?;
        Self::remove_optional(&path).await
    }

    async fn get(&self, entity_type: &EntityType, entity_id: &str) -> Result<Option<Value>> {
        let path = self.entity_path(entity_type, entity_id)?;
        match Self::read_optional(&path).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }
}
