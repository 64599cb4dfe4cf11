use std::collections::BTreeSet;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pkg_constants::state::REGISTRY_PREFIX;

use crate::client::StateStore;
use crate::store::PolicyStore;
use crate::watch::{EventType, WatchEvent};

/// Mirrors committed store changes into a [`StateStore`].
pub struct Persister {
    store: PolicyStore,
    backend: StateStore,
}

impl Persister {
    pub fn new(store: PolicyStore, backend: StateStore) -> Self {
        Self { store, backend }
    }

    /// Load persisted objects into the store. Goes through `apply`, so the
    /// persisted state must still pass validation as a whole.
    pub async fn hydrate(&self) -> anyhow::Result<usize> {
        let objects = self.backend.load_objects().await?;
        let count = objects.len();
        if count > 0 {
            self.store
                .apply(objects)
                .await
                .map_err(|e| anyhow::anyhow!("Persisted policy state is invalid: {}", e))?;
        }
        info!("Hydrated {} policy objects from disk", count);
        Ok(count)
    }

    /// Rewrite the backend from the current store contents.
    pub async fn resync(&self) -> anyhow::Result<()> {
        let snapshot = self.store.snapshot().await;
        let live: BTreeSet<String> = snapshot
            .objects
            .iter()
            .map(|o| o.key().registry_key())
            .collect();
        for (key, _) in self.backend.list_prefix(REGISTRY_PREFIX).await? {
            if !live.contains(&key) {
                self.backend.delete_raw(&key).await?;
            }
        }
        for object in &snapshot.objects {
            self.backend.put_object(object).await?;
        }
        info!(
            "Resynced {} policy objects at revision {}",
            snapshot.objects.len(),
            snapshot.revision
        );
        Ok(())
    }

    async fn write(&self, event: &WatchEvent) -> anyhow::Result<()> {
        match (event.event_type, &event.object) {
            (EventType::Put, Some(object)) => self.backend.put_object(object).await,
            _ => self.backend.delete_object(&event.key).await,
        }
    }

    /// Write whatever the receiver still buffers. Commits that landed just
    /// before shutdown must reach the backend too.
    async fn drain(&self, rx: &mut tokio::sync::broadcast::Receiver<WatchEvent>) {
        let mut drained = 0usize;
        loop {
            match rx.try_recv() {
                Ok(event) => {
                    if let Err(e) = self.write(&event).await {
                        warn!("Persister write error for {}: {}", event.key, e);
                    }
                    drained += 1;
                }
                Err(TryRecvError::Lagged(missed)) => {
                    warn!("Persister lagged by {} events at shutdown, resyncing", missed);
                    if let Err(e) = self.resync().await {
                        warn!("Persister resync error: {}", e);
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        if drained > 0 {
            info!("Persister flushed {} pending events", drained);
        }
    }

    /// Follow the store's watch log until `shutdown` fires, then flush the
    /// events still buffered.
    pub fn start(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let mut rx = self.store.event_log.subscribe();
        tokio::spawn(async move {
            info!("Persister started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(event) => {
                            if let Err(e) = self.write(&event).await {
                                warn!("Persister write error for {}: {}", event.key, e);
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!("Persister lagged by {} events, resyncing", missed);
                            if let Err(e) = self.resync().await {
                                warn!("Persister resync error: {}", e);
                            }
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            self.drain(&mut rx).await;
            if let Err(e) = self.backend.close().await {
                warn!("Persister close error: {}", e);
            }
            info!("Persister stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::namespace::Namespace;
    use pkg_types::rbac::{PolicyRule, Role};
    use pkg_types::{ObjectKey, ObjectKind};

    #[tokio::test]
    async fn round_trips_through_slatedb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap().to_string();

        let store = PolicyStore::new();
        let backend = StateStore::open(&path).await.unwrap();
        let shutdown = CancellationToken::new();
        let handle = Persister::new(store.clone(), backend).start(shutdown.clone());

        store.put(Namespace::new("ns-a")).await.unwrap();
        store
            .put(Role::namespaced("ns-a", "reader", vec![PolicyRule::new(["pods"], ["get"])]))
            .await
            .unwrap();
        store.put(Namespace::new("ns-b")).await.unwrap();
        store.delete(&ObjectKey::namespace("ns-b")).await.unwrap();

        // Let the persister drain the events before shutting it down.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let restored = PolicyStore::new();
        let backend = StateStore::open(&path).await.unwrap();
        let count = Persister::new(restored.clone(), backend).hydrate().await.unwrap();
        assert_eq!(count, 2);
        assert!(restored.get(&ObjectKey::namespace("ns-b")).await.is_none());
        assert_eq!(restored.list(ObjectKind::Role, Some("ns-a")).await.len(), 1);
    }

    #[tokio::test]
    async fn writes_committed_before_shutdown_survive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap().to_string();

        let store = PolicyStore::new();
        let backend = StateStore::open(&path).await.unwrap();
        let shutdown = CancellationToken::new();
        let handle = Persister::new(store.clone(), backend).start(shutdown.clone());

        store.put(Namespace::new("ns-a")).await.unwrap();
        store
            .put(Role::namespaced("ns-a", "reader", vec![PolicyRule::new(["pods"], ["get"])]))
            .await
            .unwrap();
        shutdown.cancel();
        handle.await.unwrap();

        let restored = PolicyStore::new();
        let backend = StateStore::open(&path).await.unwrap();
        let count = Persister::new(restored.clone(), backend).hydrate().await.unwrap();
        assert_eq!(count, 2);
        assert!(restored.get(&ObjectKey::namespace("ns-a")).await.is_some());
    }
}
