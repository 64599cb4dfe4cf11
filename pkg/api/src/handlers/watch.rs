use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use serde::Deserialize;
use std::convert::Infallible;
use std::str::FromStr;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use pkg_state::watch::WatchEvent;
use pkg_types::ObjectKind;

use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct WatchQuery {
    /// Object kind name or plural.
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Replay buffered events after this revision before going live.
    #[serde(default)]
    pub revision: Option<u64>,
}

/// Event filter built from a [`WatchQuery`]. An unknown kind matches nothing.
#[derive(Debug, Clone)]
struct WatchFilter {
    kind: Option<Option<ObjectKind>>,
    namespace: Option<String>,
}

impl WatchFilter {
    fn new(query: &WatchQuery) -> Self {
        Self {
            kind: query.kind.as_deref().map(|k| ObjectKind::from_str(k).ok()),
            namespace: query.namespace.clone(),
        }
    }

    fn matches(&self, event: &WatchEvent) -> bool {
        let kind_ok = match &self.kind {
            None => true,
            Some(kind) => *kind == Some(event.key.kind),
        };
        let ns_ok = match &self.namespace {
            None => true,
            Some(ns) => event.key.scope_namespace() == Some(ns.as_str()),
        };
        kind_ok && ns_ok
    }
}

fn to_sse(event: &WatchEvent) -> Option<Result<Event, Infallible>> {
    let data = serde_json::to_string(event).ok()?;
    Some(Ok(Event::default()
        .id(event.revision.to_string())
        .event(format!("{:?}", event.event_type))
        .data(data)))
}

/// GET /api/v1/watch: SSE endpoint streaming committed store changes.
pub async fn watch_events(
    State(state): State<AppState>,
    Query(query): Query<WatchQuery>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let from_revision = query.revision.unwrap_or(0);
    info!(
        "Watch subscription: kind={:?} namespace={:?} from_revision={}",
        query.kind, query.namespace, from_revision
    );
    let filter = WatchFilter::new(&query);

    // Subscribe before reading the buffer so nothing falls in between;
    // live events already replayed are skipped by revision.
    let rx = state.store.event_log.subscribe();
    let buffered = state.store.event_log.events_since(from_revision).await;
    let replayed_up_to = buffered.last().map(|e| e.revision).unwrap_or(from_revision);

    let buffered_filter = filter.clone();
    let buffered_stream = tokio_stream::iter(
        buffered
            .into_iter()
            .filter(move |e| buffered_filter.matches(e))
            .filter_map(|e| to_sse(&e)),
    );

    let live_stream = BroadcastStream::new(rx).filter_map(move |result| match result {
        Ok(event) if event.revision > replayed_up_to && filter.matches(&event) => to_sse(&event),
        _ => None,
    });

    Sse::new(buffered_stream.chain(live_stream)).keep_alive(KeepAlive::default())
}
