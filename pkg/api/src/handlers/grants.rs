use axum::{
    Extension, Json,
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::info;

use pkg_controllers::GrantRequest;

use crate::AppState;
use crate::auth::AuthUser;
use crate::error::ApiResult;

#[derive(Debug, Default, Deserialize)]
pub struct GrantListQuery {
    #[serde(default)]
    pub namespace: Option<String>,
    /// Only grants whose binding is currently live.
    #[serde(default)]
    pub active: bool,
}

/// POST /api/v1/grants
pub async fn request_grant(
    State(state): State<AppState>,
    Json(request): Json<GrantRequest>,
) -> ApiResult<impl IntoResponse> {
    let grant = state.jit.request_grant(request).await?;
    info!(
        "Grant {} requested by {} ({})",
        grant.id, grant.principal, grant.state
    );
    Ok((StatusCode::CREATED, Json(grant)))
}

/// GET /api/v1/grants
pub async fn list_grants(
    State(state): State<AppState>,
    Query(query): Query<GrantListQuery>,
) -> impl IntoResponse {
    let namespace = query.namespace.as_deref();
    let grants = if query.active {
        state.jit.list_active_grants(namespace).await
    } else {
        state.jit.list_grants(namespace).await
    };
    (StatusCode::OK, Json(grants))
}

/// GET /api/v1/grants/{id}
pub async fn get_grant(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<impl IntoResponse> {
    let grant = state.jit.get_grant(&id).await?;
    Ok((StatusCode::OK, Json(grant)))
}

/// POST /api/v1/grants/{id}/approve. The approver is the caller.
pub async fn approve_grant(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<impl IntoResponse> {
    let grant = state.jit.approve_grant(&id, &user.name).await?;
    Ok((StatusCode::OK, Json(grant)))
}

/// POST /api/v1/grants/{id}/revoke. Revoking a finished grant is a no-op.
pub async fn revoke_grant(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<impl IntoResponse> {
    let grant = state.jit.revoke_grant(&id, &user.name).await?;
    Ok((StatusCode::OK, Json(grant)))
}
