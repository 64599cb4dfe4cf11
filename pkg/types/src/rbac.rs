use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::object::{ObjectKey, ObjectKind};

/// Matches any verb, resource or API group.
pub const WILDCARD: &str = "*";

fn core_api_group() -> Vec<String> {
    vec![String::new()]
}

// --- Policy rules ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    /// API groups this rule applies to ("" for core, "*" for all)
    #[serde(default = "core_api_group")]
    pub api_groups: Vec<String>,
    /// Resource types (e.g., "pods", "services", "*" for all)
    pub resources: Vec<String>,
    /// Specific object names; empty means every name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_names: Vec<String>,
    /// Allowed verbs (e.g., "get", "list", "create", "update", "delete", "*" for all)
    pub verbs: Vec<String>,
}

impl PolicyRule {
    /// Rule in the core API group.
    pub fn new<R, V>(resources: R, verbs: V) -> Self
    where
        R: IntoIterator,
        R::Item: Into<String>,
        V: IntoIterator,
        V::Item: Into<String>,
    {
        Self {
            api_groups: core_api_group(),
            resources: resources.into_iter().map(Into::into).collect(),
            resource_names: Vec::new(),
            verbs: verbs.into_iter().map(Into::into).collect(),
        }
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.api_groups = vec![group.into()];
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.resource_names.push(name.into());
        self
    }

    /// Grants a wildcard verb or resource.
    pub fn is_wildcard(&self) -> bool {
        self.verbs.iter().any(|v| v == WILDCARD) || self.resources.iter().any(|r| r == WILDCARD)
    }

    /// Grants every verb on every resource in every group.
    pub fn is_unrestricted(&self) -> bool {
        self.api_groups.iter().any(|g| g == WILDCARD)
            && self.resources.iter().any(|r| r == WILDCARD)
            && self.verbs.iter().any(|v| v == WILDCARD)
            && self.resource_names.is_empty()
    }
}

// --- Role ---

/// Policy metadata attached to a role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleMetadata {
    /// JIT grants for this role need an approver other than the requester.
    #[serde(default)]
    pub requires_approval: bool,
    /// Treat bindings to this role as cluster-admin-equivalent.
    #[serde(default)]
    pub cluster_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub name: String,
    /// `None` makes this a cluster-wide role (a ClusterRole).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub metadata: RoleMetadata,
}

impl Role {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>, rules: Vec<PolicyRule>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            rules,
            metadata: RoleMetadata::default(),
        }
    }

    pub fn cluster(name: impl Into<String>, rules: Vec<PolicyRule>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            rules,
            metadata: RoleMetadata::default(),
        }
    }

    pub fn requiring_approval(mut self) -> Self {
        self.metadata.requires_approval = true;
        self
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            kind: ObjectKind::Role,
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    pub fn is_cluster_admin_equivalent(&self) -> bool {
        self.metadata.cluster_admin
            || (self.namespace.is_none() && self.name == pkg_constants::auth::CLUSTER_ADMIN_ROLE)
            || self.rules.iter().any(PolicyRule::is_unrestricted)
    }
}

// --- Subject ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubjectKind {
    User,
    Group,
    ServiceAccount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub kind: SubjectKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Subject {
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            kind: SubjectKind::User,
            name: name.into(),
            namespace: None,
        }
    }

    pub fn group(name: impl Into<String>) -> Self {
        Self {
            kind: SubjectKind::Group,
            name: name.into(),
            namespace: None,
        }
    }

    pub fn service_account(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: SubjectKind::ServiceAccount,
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }

    /// Principal name this subject authenticates as. Service accounts use
    /// `system:serviceaccount:<namespace>:<name>`.
    pub fn principal_name(&self) -> String {
        match (self.kind, &self.namespace) {
            (SubjectKind::ServiceAccount, Some(ns)) => {
                format!("system:serviceaccount:{}:{}", ns, self.name)
            }
            _ => self.name.clone(),
        }
    }
}

// --- RoleBinding ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleRefKind {
    Role,
    ClusterRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRef {
    pub kind: RoleRefKind,
    pub name: String,
}

impl RoleRef {
    pub fn role(name: impl Into<String>) -> Self {
        Self {
            kind: RoleRefKind::Role,
            name: name.into(),
        }
    }

    pub fn cluster_role(name: impl Into<String>) -> Self {
        Self {
            kind: RoleRefKind::ClusterRole,
            name: name.into(),
        }
    }

    /// Key of the role this reference points at from `namespace`.
    pub fn resolve(&self, namespace: Option<&str>) -> ObjectKey {
        match (self.kind, namespace) {
            (RoleRefKind::Role, Some(ns)) => ObjectKey::namespaced(ObjectKind::Role, ns, &self.name),
            _ => ObjectKey::cluster(ObjectKind::Role, &self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleBinding {
    pub name: String,
    /// `None` makes this a cluster-wide binding (a ClusterRoleBinding).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub role_ref: RoleRef,
    pub subjects: Vec<Subject>,
    /// The binding stops granting anything at this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Set on bindings created for a JIT access grant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant_id: Option<String>,
}

impl RoleBinding {
    pub fn namespaced(
        namespace: impl Into<String>,
        name: impl Into<String>,
        role_ref: RoleRef,
        subjects: Vec<Subject>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            role_ref,
            subjects,
            expires_at: None,
            grant_id: None,
        }
    }

    pub fn cluster(name: impl Into<String>, role: impl Into<String>, subjects: Vec<Subject>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            role_ref: RoleRef::cluster_role(role),
            subjects,
            expires_at: None,
            grant_id: None,
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            kind: ObjectKind::RoleBinding,
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    pub fn role_key(&self) -> ObjectKey {
        self.role_ref.resolve(self.namespace.as_deref())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ref_resolution() {
        let binding = RoleBinding::namespaced(
            "ns-a",
            "b",
            RoleRef::role("reader"),
            vec![Subject::user("alice")],
        );
        assert_eq!(
            binding.role_key(),
            ObjectKey::namespaced(ObjectKind::Role, "ns-a", "reader")
        );

        let binding = RoleBinding::namespaced(
            "ns-a",
            "b",
            RoleRef::cluster_role("view"),
            vec![Subject::user("alice")],
        );
        assert_eq!(binding.role_key(), ObjectKey::cluster(ObjectKind::Role, "view"));
    }

    #[test]
    fn cluster_admin_equivalence() {
        let admin = Role::cluster("cluster-admin", vec![PolicyRule::new(["pods"], ["get"])]);
        assert!(admin.is_cluster_admin_equivalent());

        let star = Role::cluster("everything", vec![PolicyRule::new(["*"], ["*"]).in_group("*")]);
        assert!(star.is_cluster_admin_equivalent());

        let reader = Role::namespaced("ns-a", "cluster-admin", vec![PolicyRule::new(["pods"], ["get"])]);
        assert!(!reader.is_cluster_admin_equivalent());
    }

    #[test]
    fn service_account_principal() {
        let sa = Subject::service_account("ci", "builder");
        assert_eq!(sa.principal_name(), "system:serviceaccount:ci:builder");
    }

    #[test]
    fn rule_defaults_to_core_group() {
        let rule: PolicyRule =
            serde_json::from_str(r#"{"resources":["pods"],"verbs":["get"]}"#).unwrap();
        assert_eq!(rule.api_groups, vec![String::new()]);
        assert!(rule.resource_names.is_empty());
    }
}
