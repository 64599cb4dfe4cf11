use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use pkg_constants::jit::DEFAULT_IDENTITY_TIMEOUT_MS;
use pkg_types::request::Principal;
use pkg_types::{PolicyError, Result};

/// External source of group memberships.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Groups `principal` belongs to. An unknown principal has no groups.
    async fn groups(&self, principal: &str) -> anyhow::Result<Vec<String>>;
}

/// Fixed principal → groups table, loaded from the server config.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityProvider {
    groups: BTreeMap<String, Vec<String>>,
}

impl StaticIdentityProvider {
    pub fn new(groups: BTreeMap<String, Vec<String>>) -> Self {
        Self { groups }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn groups(&self, principal: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.groups.get(principal).cloned().unwrap_or_default())
    }
}

/// Enriches principals with provider groups under a timeout.
///
/// Lookups fail closed: a slow provider yields `ErrIdentityTimeout`, a
/// failing one `ErrIdentityLookup`.
#[derive(Clone)]
pub struct IdentityResolver {
    provider: Option<Arc<dyn IdentityProvider>>,
    timeout: Duration,
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::disabled()
    }
}

impl IdentityResolver {
    /// Use only the groups carried by the request.
    pub fn disabled() -> Self {
        Self {
            provider: None,
            timeout: Duration::from_millis(DEFAULT_IDENTITY_TIMEOUT_MS),
        }
    }

    pub fn new(provider: Arc<dyn IdentityProvider>, timeout: Duration) -> Self {
        Self {
            provider: Some(provider),
            timeout,
        }
    }

    pub async fn resolve(&self, principal: &Principal) -> Result<Principal> {
        let Some(provider) = &self.provider else {
            return Ok(principal.clone());
        };
        let lookup = provider.groups(&principal.name);
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(groups)) => {
                let mut resolved = principal.clone();
                resolved.groups.extend(groups);
                Ok(resolved)
            }
            Ok(Err(e)) => {
                warn!("Identity lookup for {} failed: {}", principal.name, e);
                Err(PolicyError::IdentityLookup {
                    principal: principal.name.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                warn!(
                    "Identity lookup for {} timed out after {}ms",
                    principal.name,
                    self.timeout.as_millis()
                );
                Err(PolicyError::IdentityTimeout {
                    principal: principal.name.clone(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Provider that never answers in time.
    pub(crate) struct SlowProvider;

    #[async_trait]
    impl IdentityProvider for SlowProvider {
        async fn groups(&self, _principal: &str) -> anyhow::Result<Vec<String>> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(vec!["late".to_string()])
        }
    }

    struct BrokenProvider;

    #[async_trait]
    impl IdentityProvider for BrokenProvider {
        async fn groups(&self, _principal: &str) -> anyhow::Result<Vec<String>> {
            anyhow::bail!("directory unreachable")
        }
    }

    #[tokio::test]
    async fn static_groups_are_merged() {
        let mut table = BTreeMap::new();
        table.insert("alice".to_string(), vec!["sre".to_string()]);
        let resolver = IdentityResolver::new(
            Arc::new(StaticIdentityProvider::new(table)),
            Duration::from_millis(100),
        );
        let p = resolver
            .resolve(&Principal::new("alice").in_group("dev"))
            .await
            .unwrap();
        assert!(p.groups.contains("sre"));
        assert!(p.groups.contains("dev"));

        let nobody = resolver.resolve(&Principal::new("bob")).await.unwrap();
        assert!(nobody.groups.is_empty());
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let resolver = IdentityResolver::new(Arc::new(SlowProvider), Duration::from_millis(20));
        let err = resolver.resolve(&Principal::new("alice")).await.unwrap_err();
        assert_eq!(err.code(), "ErrIdentityTimeout");
    }

    #[tokio::test]
    async fn provider_error_fails_closed() {
        let resolver = IdentityResolver::new(Arc::new(BrokenProvider), Duration::from_millis(100));
        let err = resolver.resolve(&Principal::new("alice")).await.unwrap_err();
        assert_eq!(err.code(), "ErrIdentityLookup");
    }
}
