use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use pkg_constants::jit::GRANT_BINDING_PREFIX;

use crate::object::{ObjectKey, ObjectKind};
use crate::rbac::RoleRef;

/// Lifecycle of a just-in-time access grant.
///
/// `Requested → Approved → Active → {Expired, Revoked}`; a grant that never
/// became active can also be revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GrantState {
    Requested,
    Approved,
    Active,
    Expired,
    Revoked,
}

impl GrantState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, GrantState::Expired | GrantState::Revoked)
    }
}

impl fmt::Display for GrantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One entry of a grant's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantEvent {
    pub at: DateTime<Utc>,
    pub actor: String,
    pub state: GrantState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessGrant {
    pub id: String,
    pub principal: String,
    pub role_ref: RoleRef,
    pub namespace: String,
    pub duration_secs: u64,
    pub justification: String,
    pub requires_approval: bool,
    pub state: GrantState,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<GrantEvent>,
}

impl AccessGrant {
    /// Name of the RoleBinding created while this grant is active.
    pub fn binding_name(&self) -> String {
        format!("{}{}", GRANT_BINDING_PREFIX, self.id)
    }

    pub fn binding_key(&self) -> ObjectKey {
        ObjectKey::namespaced(ObjectKind::RoleBinding, &self.namespace, self.binding_name())
    }

    /// Reference used in violations and reports.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::namespaced(ObjectKind::AccessGrant, &self.namespace, &self.id)
    }

    /// Move to `state` and append to the audit trail.
    pub fn record(&mut self, state: GrantState, actor: &str, at: DateTime<Utc>, note: Option<String>) {
        self.state = state;
        self.history.push(GrantEvent {
            at,
            actor: actor.to_string(),
            state,
            note,
        });
    }

    /// True if any audit event falls within `[from, to]`.
    pub fn touched_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.history.iter().any(|e| e.at >= from && e.at <= to)
    }
}
