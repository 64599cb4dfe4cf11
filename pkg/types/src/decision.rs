use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::PolicyError;
use crate::object::ObjectKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Allow,
    Deny,
}

/// Machine-readable reason attached to every decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReasonCode {
    /// A binding's role rule matched the request.
    MatchedRule,
    /// No live binding grants the request.
    NoMatchingBinding,
    /// No network policy selects the workload in this direction.
    NoSelectingPolicy,
    /// A rule of a selecting network policy admits the flow.
    MatchedNetworkRule,
    /// Selecting network policies exist but none admits the flow.
    NoMatchingNetworkRule,
    #[serde(rename = "ErrCanceled")]
    Canceled,
    #[serde(rename = "ErrIdentityTimeout")]
    IdentityTimeout,
    #[serde(rename = "ErrIdentityLookup")]
    IdentityLookup,
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReasonCode::MatchedRule => "MatchedRule",
            ReasonCode::NoMatchingBinding => "NoMatchingBinding",
            ReasonCode::NoSelectingPolicy => "NoSelectingPolicy",
            ReasonCode::MatchedNetworkRule => "MatchedNetworkRule",
            ReasonCode::NoMatchingNetworkRule => "NoMatchingNetworkRule",
            ReasonCode::Canceled => "ErrCanceled",
            ReasonCode::IdentityTimeout => "ErrIdentityTimeout",
            ReasonCode::IdentityLookup => "ErrIdentityLookup",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of an authorization or network query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub verdict: Verdict,
    pub reason: ReasonCode,
    /// Human-readable explanation for audit logs.
    pub message: String,
    /// Binding or network policy that produced an Allow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_by: Option<ObjectKey>,
}

impl Decision {
    pub fn allow(reason: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Allow,
            reason,
            message: message.into(),
            matched_by: None,
        }
    }

    pub fn deny(reason: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Deny,
            reason,
            message: message.into(),
            matched_by: None,
        }
    }

    pub fn matched_by(mut self, key: ObjectKey) -> Self {
        self.matched_by = Some(key);
        self
    }

    /// Evaluation errors always resolve to Deny.
    pub fn from_error(err: &PolicyError) -> Self {
        let reason = match err {
            PolicyError::IdentityTimeout { .. } => ReasonCode::IdentityTimeout,
            PolicyError::IdentityLookup { .. } => ReasonCode::IdentityLookup,
            _ => ReasonCode::Canceled,
        };
        Self::deny(reason, err.to_string())
    }

    pub fn is_allowed(&self) -> bool {
        self.verdict == Verdict::Allow
    }
}
