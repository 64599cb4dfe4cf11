use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Last authorization query time per principal.
#[derive(Debug, Clone, Default)]
pub struct AccessLog {
    inner: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
}

impl AccessLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember that `principal` queried at `at`. Never moves backwards.
    pub async fn record(&self, principal: &str, at: DateTime<Utc>) {
        let mut inner = self.inner.write().await;
        let entry = inner.entry(principal.to_string()).or_insert(at);
        if at > *entry {
            *entry = at;
        }
    }

    pub async fn last_query(&self, principal: &str) -> Option<DateTime<Utc>> {
        self.inner.read().await.get(principal).copied()
    }

    /// Forget principals whose last query is older than `cutoff`.
    pub async fn prune(&self, cutoff: DateTime<Utc>) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.len();
        inner.retain(|_, at| *at >= cutoff);
        before - inner.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
