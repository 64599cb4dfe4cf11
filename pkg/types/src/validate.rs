use pkg_constants::state::MAX_NAME_LEN;

use crate::error::PolicyError;
use crate::object::{ObjectKey, PolicyObject};
use crate::rbac::RoleRefKind;
use crate::selector::{validate_label_key, validate_label_value};

/// Validate a Kubernetes-style resource name.
/// Rules: lowercase `[a-z0-9-]`, max 63 chars, no leading/trailing hyphens.
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name must not be empty".to_string());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!(
            "name '{}' exceeds {} characters (got {})",
            name,
            MAX_NAME_LEN,
            name.len()
        ));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(format!("name '{}' must not start or end with a hyphen", name));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(format!(
            "name '{}' must contain only lowercase letters, digits, and hyphens [a-z0-9-]",
            name
        ));
    }
    Ok(())
}

fn check_name(key: &ObjectKey, field: &str, name: &str) -> Result<(), PolicyError> {
    validate_name(name).map_err(|reason| PolicyError::invalid(key, field, reason))
}

fn check_non_empty(key: &ObjectKey, field: &str, values: &[String]) -> Result<(), PolicyError> {
    if values.is_empty() {
        return Err(PolicyError::invalid(key, field, "must list at least one entry"));
    }
    if values.iter().any(|v| v.trim() != v || v.contains(char::is_whitespace)) {
        return Err(PolicyError::invalid(key, field, "entries must not contain whitespace"));
    }
    Ok(())
}

/// Field-level validation of a single object, independent of other objects.
///
/// Referential integrity is checked by the store. Network policy selectors
/// are checked when the policy is compiled.
pub fn validate_object(object: &PolicyObject) -> Result<(), PolicyError> {
    let key = object.key();
    match object {
        PolicyObject::Namespace(ns) => {
            check_name(&key, "name", &ns.name)?;
            for (k, v) in &ns.labels {
                validate_label_key(k)
                    .and_then(|_| validate_label_value(k, v))
                    .map_err(|e| PolicyError::invalid(&key, format!("labels.{}", k), e.to_string()))?;
            }
        }
        PolicyObject::Role(role) => {
            check_name(&key, "name", &role.name)?;
            if let Some(ns) = &role.namespace {
                check_name(&key, "namespace", ns)?;
            }
            for (i, rule) in role.rules.iter().enumerate() {
                check_non_empty(&key, &format!("rules[{}].verbs", i), &rule.verbs)?;
                check_non_empty(&key, &format!("rules[{}].resources", i), &rule.resources)?;
                if rule.api_groups.is_empty() {
                    return Err(PolicyError::invalid(
                        &key,
                        format!("rules[{}].apiGroups", i),
                        "must list at least one entry (\"\" is the core group)",
                    ));
                }
            }
        }
        PolicyObject::RoleBinding(binding) => {
            check_name(&key, "name", &binding.name)?;
            if let Some(ns) = &binding.namespace {
                check_name(&key, "namespace", ns)?;
            }
            if binding.namespace.is_none() && binding.role_ref.kind == RoleRefKind::Role {
                return Err(PolicyError::invalid(
                    &key,
                    "roleRef.kind",
                    "a cluster-wide binding can only reference a ClusterRole",
                ));
            }
            if binding.role_ref.name.is_empty() {
                return Err(PolicyError::invalid(&key, "roleRef.name", "must not be empty"));
            }
            if binding.subjects.is_empty() {
                return Err(PolicyError::invalid(&key, "subjects", "must list at least one subject"));
            }
            if let Some(i) = binding.subjects.iter().position(|s| s.name.is_empty()) {
                return Err(PolicyError::invalid(
                    &key,
                    format!("subjects[{}].name", i),
                    "must not be empty",
                ));
            }
        }
        PolicyObject::NetworkPolicy(np) => {
            check_name(&key, "name", &np.name)?;
            check_name(&key, "namespace", &np.namespace)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Namespace;
    use crate::rbac::{PolicyRule, Role, RoleBinding, RoleRef, Subject};

    #[test]
    fn valid_names() {
        assert!(validate_name("nginx").is_ok());
        assert!(validate_name("my-app").is_ok());
        assert!(validate_name("app-123").is_ok());
        assert!(validate_name("a").is_ok());
        assert!(validate_name("a-b-c-d").is_ok());
    }

    #[test]
    fn invalid_names() {
        assert!(validate_name("").is_err());
        assert!(validate_name("My-App").is_err());
        assert!(validate_name("my_app").is_err());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name("trailing-").is_err());
        assert!(validate_name("special!char").is_err());
        assert!(validate_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn role_without_verbs_is_rejected() {
        let role = Role::namespaced("ns-a", "broken", vec![PolicyRule::new(["pods"], Vec::<String>::new())]);
        let err = validate_object(&role.into()).unwrap_err();
        assert_eq!(err.code(), "ErrInvalidObject");
        assert!(err.to_string().contains("rules[0].verbs"));
    }

    #[test]
    fn cluster_binding_must_reference_cluster_role() {
        let mut binding = RoleBinding::cluster("ops", "view", vec![Subject::user("bob")]);
        binding.role_ref = RoleRef::role("view");
        let err = validate_object(&binding.into()).unwrap_err();
        assert!(err.to_string().contains("roleRef.kind"));
    }

    #[test]
    fn namespace_labels_are_checked() {
        let ns = Namespace::new("ns-a").with_label("bad key", "x");
        assert!(validate_object(&ns.into()).is_err());
        let ns = Namespace::new("ns-a").with_label("kgate.io/env", "prod");
        assert!(validate_object(&ns.into()).is_ok());
    }
}
