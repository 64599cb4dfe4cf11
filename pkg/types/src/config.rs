use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::object::PolicyObject;

/// Server configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// port: 7443
/// data-dir: /var/lib/kgate/data
/// token: my-secret-token
/// policy-file: /etc/kgate/policies.yaml
/// sweep-interval-secs: 15
/// groups:
///   alice: [sre, oncall]
/// users:
///   alice-token: { name: alice, groups: [sre] }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfigFile {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default, alias = "data-dir")]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Policy documents applied at startup.
    #[serde(default, alias = "policy-file")]
    pub policy_file: Option<String>,
    /// Mirror the policy store into SlateDB under `data_dir`.
    #[serde(default)]
    pub persist: Option<bool>,
    #[serde(default, alias = "sweep-interval-secs")]
    pub sweep_interval_secs: Option<u64>,
    #[serde(default, alias = "drift-interval-secs")]
    pub drift_interval_secs: Option<u64>,
    #[serde(default, alias = "orphan-staleness-secs")]
    pub orphan_staleness_secs: Option<u64>,
    #[serde(default, alias = "identity-timeout-ms")]
    pub identity_timeout_ms: Option<u64>,
    #[serde(default, alias = "max-grant-duration-secs")]
    pub max_grant_duration_secs: Option<u64>,
    /// `text` (default) or `json`.
    #[serde(default, alias = "log-format")]
    pub log_format: Option<String>,
    /// Static group memberships served as the identity provider.
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
    /// API callers keyed by bearer token. What they may do is decided by
    /// the bindings in the policy store.
    #[serde(default)]
    pub users: BTreeMap<String, ApiUser>,
}

/// Identity an API bearer token authenticates as.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiUser {
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<PolicyObject>),
    One(Box<PolicyObject>),
}

/// Parse policy documents: multi-document YAML where every document is a
/// single object or a list of objects. JSON input is accepted as YAML.
pub fn parse_policy_documents(content: &str) -> anyhow::Result<Vec<PolicyObject>> {
    let mut objects = Vec::new();
    for (i, document) in serde_yaml::Deserializer::from_str(content).enumerate() {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        match serde_yaml::from_value::<OneOrMany>(value)
            .map_err(|e| anyhow::anyhow!("policy document {}: {}", i, e))?
        {
            OneOrMany::Many(many) => objects.extend(many),
            OneOrMany::One(one) => objects.push(*one),
        }
    }
    Ok(objects)
}

/// Read and parse a policy file.
pub fn load_policy_file(path: &str) -> anyhow::Result<Vec<PolicyObject>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read policy file {}: {}", path, e))?;
    parse_policy_documents(&content)
}
