use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::PolicyError;
use crate::object::{ObjectKey, ObjectKind};
use crate::selector::{LabelSelector, Selector};

/// Network policy controlling ingress/egress traffic for workloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicy {
    pub name: String,
    pub namespace: String,
    /// Workloads this policy applies to; empty selects every workload in the namespace
    #[serde(default)]
    pub pod_selector: LabelSelector,
    /// Which traffic directions this policy controls; inferred when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policy_types: Vec<PolicyType>,
    /// Allowed inbound traffic rules
    #[serde(default)]
    pub ingress: Vec<IngressRule>,
    /// Allowed outbound traffic rules
    #[serde(default)]
    pub egress: Vec<EgressRule>,
}

/// Traffic direction, relative to the selected workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyType {
    Ingress,
    Egress,
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyType::Ingress => write!(f, "Ingress"),
            PolicyType::Egress => write!(f, "Egress"),
        }
    }
}

/// Inbound traffic rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    /// Source peers allowed; empty allows every source
    #[serde(default)]
    pub from: Vec<NetworkPolicyPeer>,
    /// Ports allowed; empty allows every port
    #[serde(default)]
    pub ports: Vec<NetworkPolicyPort>,
}

/// Outbound traffic rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressRule {
    /// Destination peers allowed; empty allows every destination
    #[serde(default)]
    pub to: Vec<NetworkPolicyPeer>,
    /// Ports allowed; empty allows every port
    #[serde(default)]
    pub ports: Vec<NetworkPolicyPort>,
}

/// A peer in a network policy (pod selector and/or namespace selector).
///
/// A pod selector alone matches workloads in the policy's own namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicyPeer {
    /// Match workloads with these labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<LabelSelector>,
    /// Match namespaces with these labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
}

impl NetworkPolicyPeer {
    pub fn pods(selector: LabelSelector) -> Self {
        Self {
            pod_selector: Some(selector),
            namespace_selector: None,
        }
    }

    pub fn namespaces(selector: LabelSelector) -> Self {
        Self {
            pod_selector: None,
            namespace_selector: Some(selector),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Sctp => write!(f, "SCTP"),
        }
    }
}

/// A port in a network policy. No port means every port of the protocol;
/// `end_port` widens `port` into an inclusive range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicyPort {
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_port: Option<u16>,
}

impl NetworkPolicyPort {
    pub fn tcp(port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            port: Some(port),
            end_port: None,
        }
    }
}

impl NetworkPolicy {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, pod_selector: LabelSelector) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            pod_selector,
            policy_types: Vec::new(),
            ingress: Vec::new(),
            egress: Vec::new(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::namespaced(ObjectKind::NetworkPolicy, &self.namespace, &self.name)
    }

    /// Declared directions, or when none are declared: Ingress always,
    /// Egress if any egress rule exists.
    pub fn effective_policy_types(&self) -> Vec<PolicyType> {
        if !self.policy_types.is_empty() {
            let mut types = self.policy_types.clone();
            types.dedup();
            return types;
        }
        let mut types = vec![PolicyType::Ingress];
        if !self.egress.is_empty() {
            types.push(PolicyType::Egress);
        }
        types
    }

    /// Validate and compile every selector once. Rules of an undeclared
    /// direction are still validated but do not take effect.
    pub fn compile(&self) -> Result<CompiledNetworkPolicy, PolicyError> {
        let key = self.key();
        let pod_selector = compile_selector(&key, "podSelector", &self.pod_selector)?;
        let types = self.effective_policy_types();

        let ingress = self
            .ingress
            .iter()
            .enumerate()
            .map(|(i, r)| compile_rule(&key, &format!("ingress[{}]", i), "from", &r.from, &r.ports))
            .collect::<Result<Vec<_>, _>>()?;
        let egress = self
            .egress
            .iter()
            .enumerate()
            .map(|(i, r)| compile_rule(&key, &format!("egress[{}]", i), "to", &r.to, &r.ports))
            .collect::<Result<Vec<_>, _>>()?;
        let ingress = types.contains(&PolicyType::Ingress).then_some(ingress);
        let egress = types.contains(&PolicyType::Egress).then_some(egress);

        Ok(CompiledNetworkPolicy {
            key,
            namespace: self.namespace.clone(),
            pod_selector,
            ingress,
            egress,
        })
    }
}

fn compile_selector(key: &ObjectKey, field: &str, selector: &LabelSelector) -> Result<Selector, PolicyError> {
    Selector::compile(selector).map_err(|source| PolicyError::MalformedSelector {
        object: key.clone(),
        field: field.to_string(),
        source,
    })
}

fn compile_rule(
    key: &ObjectKey,
    field: &str,
    peer_field: &str,
    peers: &[NetworkPolicyPeer],
    ports: &[NetworkPolicyPort],
) -> Result<CompiledRule, PolicyError> {
    let mut compiled_peers = Vec::with_capacity(peers.len());
    for (i, peer) in peers.iter().enumerate() {
        let path = format!("{}.{}[{}]", field, peer_field, i);
        if peer.pod_selector.is_none() && peer.namespace_selector.is_none() {
            return Err(PolicyError::invalid(
                key,
                path,
                "peer must set podSelector or namespaceSelector",
            ));
        }
        let pod_selector = peer
            .pod_selector
            .as_ref()
            .map(|s| compile_selector(key, &format!("{}.podSelector", path), s))
            .transpose()?;
        let namespace_selector = peer
            .namespace_selector
            .as_ref()
            .map(|s| compile_selector(key, &format!("{}.namespaceSelector", path), s))
            .transpose()?;
        compiled_peers.push(CompiledPeer {
            pod_selector,
            namespace_selector,
        });
    }
    for (i, port) in ports.iter().enumerate() {
        match (port.port, port.end_port) {
            (None, Some(_)) => {
                return Err(PolicyError::invalid(
                    key,
                    format!("{}.ports[{}].endPort", field, i),
                    "endPort requires port",
                ));
            }
            (Some(start), Some(end)) if end < start => {
                return Err(PolicyError::invalid(
                    key,
                    format!("{}.ports[{}].endPort", field, i),
                    format!("endPort {} is below port {}", end, start),
                ));
            }
            _ => {}
        }
    }
    Ok(CompiledRule {
        peers: compiled_peers,
        ports: ports.to_vec(),
    })
}

/// Evaluation form of a [`NetworkPolicy`], built when the policy is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledNetworkPolicy {
    pub key: ObjectKey,
    pub namespace: String,
    pub pod_selector: Selector,
    /// `None` when the policy does not govern ingress.
    pub ingress: Option<Vec<CompiledRule>>,
    /// `None` when the policy does not govern egress.
    pub egress: Option<Vec<CompiledRule>>,
}

impl CompiledNetworkPolicy {
    pub fn rules(&self, direction: PolicyType) -> Option<&[CompiledRule]> {
        match direction {
            PolicyType::Ingress => self.ingress.as_deref(),
            PolicyType::Egress => self.egress.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRule {
    /// Empty matches every peer.
    pub peers: Vec<CompiledPeer>,
    /// Empty matches every port.
    pub ports: Vec<NetworkPolicyPort>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPeer {
    pub pod_selector: Option<Selector>,
    pub namespace_selector: Option<Selector>,
}
