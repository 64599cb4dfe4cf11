use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::object::ObjectKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ViolationKind {
    /// A role rule grants `*` verbs or resources.
    WildcardPermission,
    /// A binding grants a cluster-admin-equivalent role.
    ClusterAdminBinding,
    /// An ingress rule admits traffic from any peer.
    UnscopedNetworkIngress,
    /// An active JIT grant is not being used.
    OrphanedGrant,
    /// An object differs from the trusted baseline.
    ConfigurationDrift,
}

impl ViolationKind {
    pub fn severity(&self) -> Severity {
        match self {
            ViolationKind::ClusterAdminBinding => Severity::Critical,
            ViolationKind::WildcardPermission | ViolationKind::ConfigurationDrift => Severity::High,
            ViolationKind::UnscopedNetworkIngress | ViolationKind::OrphanedGrant => Severity::Medium,
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a drifted object changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriftChange {
    Added,
    Removed,
    Modified,
}

/// One field that differs from the baseline. `path` is a JSON pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub object: ObjectKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub message: String,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<DriftChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diff: Vec<FieldChange>,
}

impl Violation {
    pub fn new(kind: ViolationKind, object: ObjectKey, message: impl Into<String>, detected_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            namespace: object.scope_namespace().map(str::to_string),
            object,
            message: message.into(),
            detected_at,
            change: None,
            diff: Vec::new(),
        }
    }

    /// Two violations with the same key describe the same finding.
    pub fn dedup_key(&self) -> (ViolationKind, ObjectKey) {
        (self.kind, self.object.clone())
    }
}
