use slatedb::Db;
use slatedb::object_store::local::LocalFileSystem;
use slatedb::object_store::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use pkg_constants::state::REGISTRY_PREFIX;
use pkg_types::{ObjectKey, PolicyObject};

/// Durable key-value backend for policy objects, backed by SlateDB on a
/// local filesystem. Values are the JSON encoding of [`PolicyObject`] under
/// [`ObjectKey::registry_key`].
#[derive(Clone)]
pub struct StateStore {
    db: Db,
}

impl StateStore {
    /// Open (or create) a state store rooted at `path` on the local filesystem.
    pub async fn open(path: &str) -> anyhow::Result<Self> {
        info!("Opening SlateDB state store at {}", path);

        std::fs::create_dir_all(path)
            .map_err(|e| anyhow::anyhow!("Failed to create data directory {}: {}", path, e))?;

        let object_store = Arc::new(
            LocalFileSystem::new_with_prefix(path)
                .map_err(|e| anyhow::anyhow!("Failed to create local object store: {}", e))?,
        );
        let db = Db::open(Path::from("/"), object_store)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open SlateDB: {}", e))?;
        Ok(Self { db })
    }

    /// Store an object under its registry key.
    pub async fn put_object(&self, object: &PolicyObject) -> anyhow::Result<()> {
        let key = object.key().registry_key();
        let value = serde_json::to_vec(object)?;
        self.db
            .put(key.as_bytes(), &value)
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB put {} failed: {}", key, e))
            .map(|_| ())
    }

    /// Remove an object's registry key. Missing keys are not an error.
    pub async fn delete_object(&self, key: &ObjectKey) -> anyhow::Result<()> {
        let key = key.registry_key();
        self.db
            .delete(key.as_bytes())
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB delete {} failed: {}", key, e))
            .map(|_| ())
    }

    /// Delete a raw key.
    pub async fn delete_raw(&self, key: &str) -> anyhow::Result<()> {
        self.db
            .delete(key.as_bytes())
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB delete {} failed: {}", key, e))
            .map(|_| ())
    }

    /// List all key-value pairs whose keys start with `prefix`.
    pub async fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let mut results = Vec::new();
        let mut iter = self
            .db
            .scan_prefix(prefix.as_bytes())
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB scan_prefix failed: {}", e))?;

        while let Ok(Some(kv)) = iter.next().await {
            let key = String::from_utf8_lossy(&kv.key).to_string();
            results.push((key, kv.value.to_vec()));
        }
        Ok(results)
    }

    /// Every persisted policy object. Undecodable entries are skipped with a
    /// warning; the store re-validates the rest when they are applied.
    pub async fn load_objects(&self) -> anyhow::Result<Vec<PolicyObject>> {
        let entries = self.list_prefix(REGISTRY_PREFIX).await?;
        let mut objects = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match serde_json::from_slice::<PolicyObject>(&value) {
                Ok(object) => objects.push(object),
                Err(e) => warn!("Skipping undecodable entry {}: {}", key, e),
            }
        }
        Ok(objects)
    }

    /// Gracefully close the state store.
    pub async fn close(self) -> anyhow::Result<()> {
        info!("Closing SlateDB state store");
        self.db
            .close()
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB close failed: {}", e))
    }
}
