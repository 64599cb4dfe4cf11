use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::sync::broadcast;

use pkg_types::{ObjectKey, PolicyObject};

/// Type of event in the watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Put,
    Delete,
}

/// A single committed change to the policy store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    /// Store revision of the commit that produced this event.
    pub revision: u64,
    pub event_type: EventType,
    pub key: ObjectKey,
    /// The new object for `Put`, the removed one for `Delete`.
    #[serde(default)]
    pub object: Option<PolicyObject>,
}

/// In-memory event log that tracks all store mutations by revision.
/// Clients can subscribe to receive events as they are committed.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<RwLock<EventLogInner>>,
    sender: broadcast::Sender<WatchEvent>,
}

struct EventLogInner {
    /// Ring buffer of recent events (capped)
    events: VecDeque<WatchEvent>,
    max_events: usize,
}

impl EventLog {
    /// Create a new event log with the given capacity for recent events.
    pub fn new(max_events: usize) -> Self {
        let (sender, _) = broadcast::channel(max_events.max(16));
        Self {
            inner: Arc::new(RwLock::new(EventLogInner {
                events: VecDeque::with_capacity(max_events),
                max_events,
            })),
            sender,
        }
    }

    /// Record a committed change. Called by the store while it still holds
    /// its write lock, so events arrive in commit order.
    pub async fn emit(&self, event: WatchEvent) {
        let mut inner = self.inner.write().await;
        if inner.events.len() >= inner.max_events {
            inner.events.pop_front();
        }
        inner.events.push_back(event.clone());
        // No receivers is fine.
        let _ = self.sender.send(event);
    }

    /// All buffered events with a revision greater than `from_revision`.
    pub async fn events_since(&self, from_revision: u64) -> Vec<WatchEvent> {
        let inner = self.inner.read().await;
        inner
            .events
            .iter()
            .filter(|e| e.revision > from_revision)
            .cloned()
            .collect()
    }

    /// Subscribe to receive new events as they are emitted.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::ObjectKind;

    fn event(revision: u64) -> WatchEvent {
        WatchEvent {
            revision,
            event_type: EventType::Delete,
            key: ObjectKey::namespace(format!("ns-{}", revision)),
            object: None,
        }
    }

    #[tokio::test]
    async fn ring_buffer_drops_oldest() {
        let log = EventLog::new(2);
        for rev in 1..=3 {
            log.emit(event(rev)).await;
        }
        let revisions: Vec<u64> = log.events_since(0).await.iter().map(|e| e.revision).collect();
        assert_eq!(revisions, vec![2, 3]);
        assert_eq!(log.events_since(2).await.len(), 1);
    }

    #[tokio::test]
    async fn subscribers_see_new_events() {
        let log = EventLog::new(8);
        let mut rx = log.subscribe();
        log.emit(event(7)).await;
        let got = rx.recv().await.unwrap();
        assert_eq!(got.revision, 7);
        assert_eq!(got.key.kind, ObjectKind::Namespace);
    }
}
