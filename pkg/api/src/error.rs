use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use pkg_types::PolicyError;

/// JSON error body: `{"code": "ErrNotFound", "message": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Error returned by handlers. Carries the HTTP status and the error kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    /// A request body that could not be parsed into policy objects.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "ErrInvalidObject", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "ErrUnauthenticated", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "ErrForbidden", message)
    }
}

impl From<PolicyError> for ApiError {
    fn from(err: PolicyError) -> Self {
        let status = match &err {
            PolicyError::NotFound(_) | PolicyError::GrantNotFound(_) => StatusCode::NOT_FOUND,
            PolicyError::InvalidObject { .. } | PolicyError::MalformedSelector { .. } => {
                StatusCode::BAD_REQUEST
            }
            PolicyError::DanglingReference { .. } => StatusCode::CONFLICT,
            PolicyError::InvalidTarget { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            PolicyError::SelfApproval { .. } => StatusCode::FORBIDDEN,
            PolicyError::IdentityTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            PolicyError::IdentityLookup { .. } => StatusCode::BAD_GATEWAY,
            PolicyError::Canceled => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, err.code(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code.to_string(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::{ObjectKey, ObjectKind};

    #[test]
    fn policy_errors_map_to_statuses() {
        let role = ObjectKey::namespaced(ObjectKind::Role, "ns-a", "reader");
        let cases = [
            (PolicyError::NotFound(role.clone()), StatusCode::NOT_FOUND, "ErrNotFound"),
            (
                PolicyError::GrantNotFound("g1".into()),
                StatusCode::NOT_FOUND,
                "ErrGrantNotFound",
            ),
            (
                PolicyError::invalid(&role, "name", "empty"),
                StatusCode::BAD_REQUEST,
                "ErrInvalidObject",
            ),
            (
                PolicyError::DanglingReference {
                    object: ObjectKey::namespaced(ObjectKind::RoleBinding, "ns-a", "b"),
                    field: "roleRef".into(),
                    target: role.clone(),
                },
                StatusCode::CONFLICT,
                "ErrDanglingReference",
            ),
            (
                PolicyError::InvalidTarget { target: role },
                StatusCode::UNPROCESSABLE_ENTITY,
                "ErrInvalidTarget",
            ),
            (
                PolicyError::SelfApproval {
                    grant: "g1".into(),
                    approver: "alice".into(),
                },
                StatusCode::FORBIDDEN,
                "ErrSelfApproval",
            ),
        ];
        for (err, status, code) in cases {
            let api: ApiError = err.into();
            assert_eq!(api.status, status);
            assert_eq!(api.code, code);
        }
    }
}
