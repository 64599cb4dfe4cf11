use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::network_policy::{PolicyType, Protocol};

/// An authenticated identity and the groups it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub name: String,
    #[serde(default)]
    pub groups: BTreeSet<String>,
}

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            groups: BTreeSet::new(),
        }
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }
}

/// "Can `principal` do `verb` on `resource` in `namespace`?"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRequest {
    pub principal: Principal,
    pub verb: String,
    /// API group of the resource; "" is the core group.
    #[serde(default)]
    pub api_group: String,
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
    /// `None` for cluster-scoped resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl AccessRequest {
    pub fn new(principal: Principal, verb: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            principal,
            verb: verb.into(),
            api_group: String::new(),
            resource: resource.into(),
            resource_name: None,
            namespace: None,
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.resource_name = Some(name.into());
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.api_group = group.into();
        self
    }
}

/// A workload identified by its namespace and labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Workload {
    pub fn new<I, K, V>(namespace: impl Into<String>, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            namespace: namespace.into(),
            labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// A traffic flow from `source` to `destination`. `direction` says whose
/// policies govern it: Ingress for the destination's, Egress for the source's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkFlow {
    pub source: Workload,
    pub destination: Workload,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    pub direction: PolicyType,
}
