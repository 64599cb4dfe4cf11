use axum::{
    Json,
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::info;

use pkg_metrics::{POLICY_OBJECTS, POLICY_WRITES};
use pkg_types::config::parse_policy_documents;
use pkg_types::{ObjectKey, ObjectKind, PolicyError};

use crate::AppState;
use crate::error::{ApiError, ApiResult};

/// Query parameters for object lookups.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ApplyResponse {
    pub revision: u64,
    pub applied: usize,
}

fn parse_kind(kind: &str) -> ApiResult<ObjectKind> {
    ObjectKind::from_str(kind).map_err(ApiError::malformed)
}

/// Namespaces are addressed by name alone; other kinds are cluster-scoped
/// unless a namespace is given.
fn object_key(kind: ObjectKind, name: &str, namespace: Option<&str>) -> ObjectKey {
    match (kind, namespace) {
        (ObjectKind::Namespace, _) => ObjectKey::namespace(name),
        (_, Some(ns)) => ObjectKey::namespaced(kind, ns, name),
        (_, None) => ObjectKey::cluster(kind, name),
    }
}

async fn refresh_object_gauges(state: &AppState) {
    let store = state.store.read().await;
    for kind in ObjectKind::STORED {
        let count = store.iter_kind(kind, None).count();
        let label = kind.to_string();
        state
            .metrics
            .gauge_set(POLICY_OBJECTS, &[("kind", &label)], count as i64);
    }
}

/// POST /api/v1/apply: JSON or multi-document YAML, applied all-or-nothing.
pub async fn apply(State(state): State<AppState>, body: String) -> ApiResult<impl IntoResponse> {
    let objects = parse_policy_documents(&body).map_err(|e| ApiError::malformed(e.to_string()))?;
    let applied = objects.len();
    let revision = state.store.apply(objects).await?;
    state
        .metrics
        .counter_add(POLICY_WRITES, &[("op", "apply")], applied as u64);
    refresh_object_gauges(&state).await;
    info!("Applied {} policy objects at revision {}", applied, revision);
    Ok((StatusCode::OK, Json(ApplyResponse { revision, applied })))
}

/// GET /api/v1/objects/{kind}
pub async fn list_objects(
    State(state): State<AppState>,
    AxumPath(kind): AxumPath<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let kind = parse_kind(&kind)?;
    let objects = state.store.list(kind, query.namespace.as_deref()).await;
    Ok((StatusCode::OK, Json(objects)))
}

/// GET /api/v1/objects/{kind}/{name}
pub async fn get_object(
    State(state): State<AppState>,
    AxumPath((kind, name)): AxumPath<(String, String)>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let key = object_key(parse_kind(&kind)?, &name, query.namespace.as_deref());
    match state.store.get(&key).await {
        Some(object) => Ok((StatusCode::OK, Json(object))),
        None => Err(PolicyError::NotFound(key).into()),
    }
}

/// DELETE /api/v1/objects/{kind}/{name}. Deleting a namespace removes
/// everything in it.
pub async fn delete_object(
    State(state): State<AppState>,
    AxumPath((kind, name)): AxumPath<(String, String)>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let key = object_key(parse_kind(&kind)?, &name, query.namespace.as_deref());
    match state.store.delete(&key).await? {
        Some(object) => {
            state
                .metrics
                .counter_inc(POLICY_WRITES, &[("op", "delete")]);
            refresh_object_gauges(&state).await;
            info!("Deleted {}", key);
            Ok((StatusCode::OK, Json(object)))
        }
        None => Err(PolicyError::NotFound(key).into()),
    }
}
