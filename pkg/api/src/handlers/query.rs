use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};

use pkg_types::request::{AccessRequest, NetworkFlow};

use crate::AppState;

/// POST /api/v1/authorize: "can this principal do this?" Always answers
/// with a Decision; evaluation errors come back as a Deny.
pub async fn authorize(
    State(state): State<AppState>,
    Json(request): Json<AccessRequest>,
) -> impl IntoResponse {
    let decision = state
        .authorizer
        .authorize(&request, &state.eval_context())
        .await;
    (StatusCode::OK, Json(decision))
}

/// POST /api/v1/network/check
pub async fn check_network(
    State(state): State<AppState>,
    Json(flow): Json<NetworkFlow>,
) -> impl IntoResponse {
    let decision = state.network.check(&flow, &state.eval_context()).await;
    (StatusCode::OK, Json(decision))
}
