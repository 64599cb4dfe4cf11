use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use pkg_constants::state::{CLUSTER_SCOPE_SEGMENT, REGISTRY_PREFIX};

use crate::namespace::Namespace;
use crate::network_policy::NetworkPolicy;
use crate::rbac::{Role, RoleBinding};

/// Kinds of objects kgate knows about.
///
/// `AccessGrant` is only used to reference grants in violations and
/// reports; grants are owned by the JIT controller, not the policy store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Namespace,
    Role,
    RoleBinding,
    NetworkPolicy,
    AccessGrant,
}

impl ObjectKind {
    /// Kinds held by the policy store, in dependency order.
    pub const STORED: [ObjectKind; 4] = [
        ObjectKind::Namespace,
        ObjectKind::Role,
        ObjectKind::RoleBinding,
        ObjectKind::NetworkPolicy,
    ];

    /// Lowercase plural used in registry keys and API paths.
    pub fn plural(&self) -> &'static str {
        match self {
            ObjectKind::Namespace => "namespaces",
            ObjectKind::Role => "roles",
            ObjectKind::RoleBinding => "rolebindings",
            ObjectKind::NetworkPolicy => "networkpolicies",
            ObjectKind::AccessGrant => "accessgrants",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjectKind::Namespace => "Namespace",
            ObjectKind::Role => "Role",
            ObjectKind::RoleBinding => "RoleBinding",
            ObjectKind::NetworkPolicy => "NetworkPolicy",
            ObjectKind::AccessGrant => "AccessGrant",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ObjectKind {
    type Err = String;

    /// Accepts the kind name or its plural, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        ObjectKind::STORED
            .into_iter()
            .find(|k| k.plural() == lower || k.to_string().to_ascii_lowercase() == lower)
            .ok_or_else(|| format!("unknown object kind '{}'", s))
    }
}

/// Identity of an object: kind, optional namespace, name.
///
/// Ordering is (kind, namespace, name), with cluster-scoped objects sorting
/// before namespaced ones of the same kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn cluster(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: None,
            name: name.into(),
        }
    }

    pub fn namespaced(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn namespace(name: impl Into<String>) -> Self {
        Self::cluster(ObjectKind::Namespace, name)
    }

    /// Persisted key, e.g. `/registry/rolebindings/ns-a/alice-reader`.
    pub fn registry_key(&self) -> String {
        format!(
            "{}{}/{}/{}",
            REGISTRY_PREFIX,
            self.kind.plural(),
            self.namespace.as_deref().unwrap_or(CLUSTER_SCOPE_SEGMENT),
            self.name
        )
    }

    /// Namespace this object lives in; a Namespace is its own scope.
    pub fn scope_namespace(&self) -> Option<&str> {
        match self.kind {
            ObjectKind::Namespace => Some(&self.name),
            _ => self.namespace.as_deref(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Closed set of policy documents the store accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PolicyObject {
    Namespace(Namespace),
    Role(Role),
    RoleBinding(RoleBinding),
    NetworkPolicy(NetworkPolicy),
}

impl PolicyObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            PolicyObject::Namespace(_) => ObjectKind::Namespace,
            PolicyObject::Role(_) => ObjectKind::Role,
            PolicyObject::RoleBinding(_) => ObjectKind::RoleBinding,
            PolicyObject::NetworkPolicy(_) => ObjectKind::NetworkPolicy,
        }
    }

    pub fn key(&self) -> ObjectKey {
        match self {
            PolicyObject::Namespace(ns) => ns.key(),
            PolicyObject::Role(role) => role.key(),
            PolicyObject::RoleBinding(binding) => binding.key(),
            PolicyObject::NetworkPolicy(np) => np.key(),
        }
    }

    pub fn as_role(&self) -> Option<&Role> {
        match self {
            PolicyObject::Role(role) => Some(role),
            _ => None,
        }
    }

    pub fn as_binding(&self) -> Option<&RoleBinding> {
        match self {
            PolicyObject::RoleBinding(binding) => Some(binding),
            _ => None,
        }
    }

    pub fn as_network_policy(&self) -> Option<&NetworkPolicy> {
        match self {
            PolicyObject::NetworkPolicy(np) => Some(np),
            _ => None,
        }
    }

    pub fn as_namespace(&self) -> Option<&Namespace> {
        match self {
            PolicyObject::Namespace(ns) => Some(ns),
            _ => None,
        }
    }
}

impl From<Namespace> for PolicyObject {
    fn from(ns: Namespace) -> Self {
        PolicyObject::Namespace(ns)
    }
}

impl From<Role> for PolicyObject {
    fn from(role: Role) -> Self {
        PolicyObject::Role(role)
    }
}

impl From<RoleBinding> for PolicyObject {
    fn from(binding: RoleBinding) -> Self {
        PolicyObject::RoleBinding(binding)
    }
}

impl From<NetworkPolicy> for PolicyObject {
    fn from(np: NetworkPolicy) -> Self {
        PolicyObject::NetworkPolicy(np)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_keys() {
        assert_eq!(
            ObjectKey::namespaced(ObjectKind::RoleBinding, "ns-a", "alice").registry_key(),
            "/registry/rolebindings/ns-a/alice"
        );
        assert_eq!(
            ObjectKey::cluster(ObjectKind::Role, "cluster-admin").registry_key(),
            "/registry/roles/_cluster/cluster-admin"
        );
    }

    #[test]
    fn kind_from_str() {
        assert_eq!("roles".parse::<ObjectKind>(), Ok(ObjectKind::Role));
        assert_eq!("NetworkPolicy".parse::<ObjectKind>(), Ok(ObjectKind::NetworkPolicy));
        assert!("accessgrants".parse::<ObjectKind>().is_err());
        assert!("pods".parse::<ObjectKind>().is_err());
    }

    #[test]
    fn tagged_document() {
        let doc = r#"{"kind":"Namespace","name":"ns-a","labels":{"team":"core"}}"#;
        let obj: PolicyObject = serde_json::from_str(doc).unwrap();
        assert_eq!(obj.kind(), ObjectKind::Namespace);
        assert_eq!(obj.key(), ObjectKey::namespace("ns-a"));
        let back = serde_json::to_value(&obj).unwrap();
        assert_eq!(back["kind"], "Namespace");
    }
}
