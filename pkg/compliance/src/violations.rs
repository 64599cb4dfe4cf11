use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

use pkg_constants::compliance::VIOLATION_LOG_CAPACITY;
use pkg_types::violation::Violation;

/// Ring buffer of violations found by periodic scans, oldest first.
#[derive(Debug, Clone)]
pub struct ViolationLog {
    inner: Arc<RwLock<VecDeque<Violation>>>,
    capacity: usize,
}

impl Default for ViolationLog {
    fn default() -> Self {
        Self::new(VIOLATION_LOG_CAPACITY)
    }
}

impl ViolationLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    pub async fn record(&self, violations: impl IntoIterator<Item = Violation>) {
        let mut inner = self.inner.write().await;
        for v in violations {
            if inner.len() >= self.capacity {
                inner.pop_front();
            }
            inner.push_back(v);
        }
    }

    /// Violations detected within `[from, to]`.
    pub async fn between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Violation> {
        self.inner
            .read()
            .await
            .iter()
            .filter(|v| v.detected_at >= from && v.detected_at <= to)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::ObjectKey;
    use pkg_types::violation::ViolationKind;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn violation(secs: i64) -> Violation {
        Violation::new(
            ViolationKind::WildcardPermission,
            ObjectKey::namespace(format!("ns-{}", secs)),
            "test",
            at(secs),
        )
    }

    #[tokio::test]
    async fn bounded_and_filtered_by_time() {
        let log = ViolationLog::new(3);
        log.record((0..5).map(violation)).await;
        assert_eq!(log.len().await, 3);
        let window = log.between(at(3), at(10)).await;
        assert_eq!(window.len(), 2);
        assert!(log.between(at(100), at(200)).await.is_empty());
    }
}
