use thiserror::Error;

use crate::object::ObjectKey;
use crate::selector::SelectorError;

/// Result type for store, evaluator and controller operations.
pub type Result<T> = std::result::Result<T, PolicyError>;

/// Error taxonomy shared by every kgate component.
///
/// Write-time variants reject the whole write. Evaluation-time variants
/// (`IdentityTimeout`, `IdentityLookup`, `Canceled`) are turned into a Deny
/// decision by the evaluators and never surface as an Allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    /// A policy object refers to an object that does not exist.
    #[error("{object}: field `{field}` references missing {target}")]
    DanglingReference {
        object: ObjectKey,
        field: String,
        target: ObjectKey,
    },

    /// A JIT grant names a Role or Namespace that does not exist.
    #[error("invalid grant target: {target} does not exist")]
    InvalidTarget { target: ObjectKey },

    /// The external identity provider did not answer in time.
    #[error("identity lookup for '{principal}' exceeded {timeout_ms}ms")]
    IdentityTimeout { principal: String, timeout_ms: u64 },

    /// The external identity provider failed.
    #[error("identity lookup for '{principal}' failed: {reason}")]
    IdentityLookup { principal: String, reason: String },

    /// Evaluation was canceled or ran past its deadline.
    #[error("evaluation canceled before a decision was reached")]
    Canceled,

    /// A label selector is syntactically invalid.
    #[error("{object}: field `{field}` has a malformed selector: {source}")]
    MalformedSelector {
        object: ObjectKey,
        field: String,
        #[source]
        source: SelectorError,
    },

    /// A field failed validation.
    #[error("{object}: field `{field}` is invalid: {reason}")]
    InvalidObject {
        object: ObjectKey,
        field: String,
        reason: String,
    },

    #[error("{0} not found")]
    NotFound(ObjectKey),

    #[error("access grant '{0}' not found")]
    GrantNotFound(String),

    /// The approver of a grant that requires approval is its requester.
    #[error("grant '{grant}' cannot be approved by its requester '{approver}'")]
    SelfApproval { grant: String, approver: String },
}

impl PolicyError {
    /// Machine-readable error kind, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            PolicyError::DanglingReference { .. } => "ErrDanglingReference",
            PolicyError::InvalidTarget { .. } => "ErrInvalidTarget",
            PolicyError::IdentityTimeout { .. } => "ErrIdentityTimeout",
            PolicyError::IdentityLookup { .. } => "ErrIdentityLookup",
            PolicyError::Canceled => "ErrCanceled",
            PolicyError::MalformedSelector { .. } => "ErrMalformedSelector",
            PolicyError::InvalidObject { .. } => "ErrInvalidObject",
            PolicyError::NotFound(_) => "ErrNotFound",
            PolicyError::GrantNotFound(_) => "ErrGrantNotFound",
            PolicyError::SelfApproval { .. } => "ErrSelfApproval",
        }
    }

    /// Shorthand for [`PolicyError::InvalidObject`].
    pub fn invalid(object: &ObjectKey, field: impl Into<String>, reason: impl Into<String>) -> Self {
        PolicyError::InvalidObject {
            object: object.clone(),
            field: field.into(),
            reason: reason.into(),
        }
    }
}
