use axum::{
    extract::{Request, State},
    http::{Method, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{debug, warn};

use pkg_constants::auth::{ADMIN_USER, API_GROUP, OPERATORS_GROUP};
use pkg_types::ObjectKind;
use pkg_types::request::{AccessRequest, Principal};

use crate::AppState;
use crate::error::ApiError;

/// Information about the authenticated entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub name: String,
    pub groups: Vec<String>,
}

impl AuthUser {
    /// The built-in operator identity behind the admin token.
    pub fn admin() -> Self {
        Self {
            name: ADMIN_USER.to_string(),
            groups: vec![OPERATORS_GROUP.to_string()],
        }
    }

    pub fn principal(&self) -> Principal {
        self.groups
            .iter()
            .fold(Principal::new(&self.name), |p, g| p.in_group(g))
    }
}

/// Middleware: authenticates the request using a Bearer token.
/// The admin token maps to the `admin` user in the operators group; other
/// tokens map to the users configured for them.
pub async fn auth_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let token = match req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        Some(token) => token.trim().to_string(),
        None => return ApiError::unauthorized("missing bearer token").into_response(),
    };

    let Some(user) = state.tokens.get(&token).cloned() else {
        warn!("Invalid Bearer token provided");
        return ApiError::unauthorized("invalid bearer token").into_response();
    };

    req.extensions_mut().insert(user);
    next.run(req).await
}

/// Extracts the verb from the HTTP method and path.
/// `POST .../{id}/approve` and `.../revoke` are verbs of their own.
pub fn action_from_request(method: &Method, path: &str) -> &'static str {
    let last = path.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
    match (method, last) {
        (&Method::POST, "approve") => "approve",
        (&Method::POST, "revoke") => "revoke",
        (&Method::GET, "watch") => "watch",
        (&Method::GET, _) => "get",
        (&Method::POST, _) => "create",
        (&Method::PUT, _) | (&Method::PATCH, _) => "update",
        (&Method::DELETE, _) => "delete",
        _ => "",
    }
}

/// Maps an API path to the resource it acts on.
/// `/api/v1/objects/{kind}/...` names the object kind in plural form, every other
/// endpoint is its own resource (`grants`, `compliance`, ...).
pub fn resource_from_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    match parts.as_slice() {
        ["api", "v1", "objects", kind, ..] => ObjectKind::from_str(kind)
            .map(|k| k.plural().to_string())
            .unwrap_or_else(|_| kind.to_ascii_lowercase()),
        ["api", "v1", resource, ..] => resource.to_string(),
        _ => "*".to_string(),
    }
}

/// Middleware: authorizes the authenticated user against the policy store.
/// The API is protected by the same evaluator it serves.
pub async fn rbac_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(user) = req.extensions().get::<AuthUser>().cloned() else {
        return ApiError::unauthorized("unauthenticated").into_response();
    };

    let path = req.uri().path().to_string();
    let action = action_from_request(req.method(), &path);
    let resource = resource_from_path(&path);

    let access = AccessRequest::new(user.principal(), action, &resource).in_group(API_GROUP);
    let decision = state.authorizer.authorize(&access, &state.eval_context()).await;
    debug!(
        user = %user.name,
        action,
        resource = %resource,
        path = %path,
        reason = %decision.reason,
        "RBAC check"
    );

    if !decision.is_allowed() {
        warn!(
            "RBAC denied: user={} action={} resource={}",
            user.name, action, resource
        );
        return ApiError::forbidden(decision.message).into_response();
    }
    next.run(req).await
}
