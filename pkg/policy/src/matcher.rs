//! Pure matching predicates. Nothing here touches the store or the clock.

use std::collections::BTreeMap;

use pkg_types::network_policy::{NetworkPolicyPort, Protocol};
use pkg_types::rbac::{PolicyRule, Subject, SubjectKind, WILDCARD};
use pkg_types::request::{AccessRequest, Principal};
use pkg_types::selector::{Op, Selector};

fn contains_or_wildcard(values: &[String], wanted: &str) -> bool {
    values.iter().any(|v| v == WILDCARD || v == wanted)
}

/// Does `rule` permit `request`? A request without a resource name only
/// matches rules that do not restrict names.
pub fn matches_rule(rule: &PolicyRule, request: &AccessRequest) -> bool {
    if !contains_or_wildcard(&rule.api_groups, &request.api_group) {
        return false;
    }
    if !contains_or_wildcard(&rule.resources, &request.resource) {
        return false;
    }
    if !rule.resource_names.is_empty() {
        match &request.resource_name {
            Some(name) if rule.resource_names.contains(name) => {}
            _ => return false,
        }
    }
    contains_or_wildcard(&rule.verbs, &request.verb)
}

/// Every requirement must hold. The empty selector matches everything.
pub fn matches_selector(selector: &Selector, labels: &BTreeMap<String, String>) -> bool {
    selector.requirements().iter().all(|req| {
        let value = labels.get(&req.key);
        match &req.op {
            Op::Equals(v) => value == Some(v),
            Op::NotEquals(v) => value != Some(v),
            Op::In(values) => value.is_some_and(|v| values.contains(v)),
            Op::NotIn(values) => value.is_none_or(|v| !values.contains(v)),
            Op::Exists => value.is_some(),
            Op::DoesNotExist => value.is_none(),
        }
    })
}

/// Users and service accounts match by name, groups by membership.
pub fn matches_subject(subject: &Subject, principal: &Principal) -> bool {
    match subject.kind {
        SubjectKind::User => subject.name == principal.name,
        SubjectKind::Group => principal.groups.contains(&subject.name),
        SubjectKind::ServiceAccount => subject.principal_name() == principal.name,
    }
}

/// A port entry without a number matches every port of its protocol.
pub fn matches_port(entry: &NetworkPolicyPort, port: u16, protocol: Protocol) -> bool {
    if entry.protocol != protocol {
        return false;
    }
    match entry.port {
        None => true,
        Some(start) => {
            let end = entry.end_port.unwrap_or(start);
            (start..=end).contains(&port)
        }
    }
}
