use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use pkg_constants::compliance::DEFAULT_ORPHAN_STALENESS_SECS;
use pkg_policy::AccessLog;
use pkg_state::{PolicyStore, Snapshot};
use pkg_types::clock::SharedClock;
use pkg_types::grant::AccessGrant;
use pkg_types::network_policy::PolicyType;
use pkg_types::violation::{DriftChange, FieldChange, Violation, ViolationKind};
use pkg_types::{ObjectKey, PolicyObject};

use crate::diff::diff_values;

/// Read access to JIT grants, for orphan detection and drift exclusion.
#[async_trait]
pub trait GrantLedger: Send + Sync {
    async fn active_grants(&self) -> Vec<AccessGrant>;

    /// Grants with at least one audit event in `[from, to]`.
    async fn grants_touched_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<AccessGrant>;
}

/// Scans the policy store for misconfigurations and for drift against a
/// trusted baseline. Read-only with respect to the store.
#[derive(Clone)]
pub struct DriftDetector {
    store: PolicyStore,
    clock: SharedClock,
    access_log: AccessLog,
    grants: Option<Arc<dyn GrantLedger>>,
    baseline: Arc<RwLock<Option<Snapshot>>>,
    staleness: chrono::Duration,
}

impl DriftDetector {
    pub fn new(store: PolicyStore, clock: SharedClock, access_log: AccessLog) -> Self {
        Self {
            store,
            clock,
            access_log,
            grants: None,
            baseline: Arc::new(RwLock::new(None)),
            staleness: chrono::Duration::seconds(DEFAULT_ORPHAN_STALENESS_SECS as i64),
        }
    }

    pub fn with_grants(mut self, grants: Arc<dyn GrantLedger>) -> Self {
        self.grants = Some(grants);
        self
    }

    pub fn with_staleness(mut self, staleness: chrono::Duration) -> Self {
        self.staleness = staleness;
        self
    }

    pub fn grants(&self) -> Option<&Arc<dyn GrantLedger>> {
        self.grants.as_ref()
    }

    /// Replace the trusted baseline. Snapshots whose content hash does not
    /// match their objects are refused.
    pub async fn set_baseline(&self, snapshot: Snapshot) -> anyhow::Result<()> {
        if !snapshot.verify() {
            anyhow::bail!(
                "baseline snapshot at revision {} fails its content hash check",
                snapshot.revision
            );
        }
        info!(
            "Baseline set at revision {} ({} objects, hash {})",
            snapshot.revision,
            snapshot.objects.len(),
            snapshot.hash
        );
        *self.baseline.write().await = Some(snapshot);
        Ok(())
    }

    /// Snapshot the store and trust it as the new baseline.
    pub async fn take_baseline(&self) -> Snapshot {
        let snapshot = self.store.snapshot().await;
        info!(
            "Baseline taken at revision {} ({} objects, hash {})",
            snapshot.revision,
            snapshot.objects.len(),
            snapshot.hash
        );
        *self.baseline.write().await = Some(snapshot.clone());
        snapshot
    }

    pub async fn baseline(&self) -> Option<Snapshot> {
        self.baseline.read().await.clone()
    }

    /// One full scan: misconfiguration checks, orphaned grants and, when a
    /// baseline is set, configuration drift.
    pub async fn scan(&self) -> Vec<Violation> {
        let now = self.clock.now();
        let current = self.store.snapshot().await;
        let active = match &self.grants {
            Some(ledger) => ledger.active_grants().await,
            None => Vec::new(),
        };

        let mut violations = misconfigurations(&current, now);
        violations.extend(self.orphaned_grants(&active, now).await);
        // Entries past the window no longer change any orphan verdict.
        let pruned = self.access_log.prune(now - self.staleness).await;
        if pruned > 0 {
            debug!("Pruned {} stale access log entries", pruned);
        }
        if let Some(baseline) = self.baseline.read().await.as_ref() {
            let owned: BTreeSet<ObjectKey> = active.iter().map(AccessGrant::binding_key).collect();
            violations.extend(drift(baseline, &current, &owned, now));
        }
        violations
    }

    async fn orphaned_grants(&self, active: &[AccessGrant], now: DateTime<Utc>) -> Vec<Violation> {
        let mut out = Vec::new();
        for grant in active {
            let last_query = self.access_log.last_query(&grant.principal).await;
            // A fresh grant gets a full window before it counts as unused.
            let last_seen = match (last_query, grant.activated_at) {
                (Some(q), Some(a)) => q.max(a),
                (q, a) => q.or(a).unwrap_or(grant.requested_at),
            };
            if now - last_seen >= self.staleness {
                let message = match last_query {
                    Some(q) => format!(
                        "active grant for {} unused since {}",
                        grant.principal,
                        q.to_rfc3339()
                    ),
                    None => format!(
                        "active grant for {} has no authorization queries",
                        grant.principal
                    ),
                };
                out.push(Violation::new(ViolationKind::OrphanedGrant, grant.key(), message, now));
            }
        }
        out
    }
}

/// Checks that need nothing but the current objects.
fn misconfigurations(current: &Snapshot, now: DateTime<Utc>) -> Vec<Violation> {
    let objects = current.by_key();
    let mut out = Vec::new();
    for (key, object) in &objects {
        match object {
            PolicyObject::Role(role) => {
                let wild: Vec<String> = role
                    .rules
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.is_wildcard())
                    .map(|(i, _)| format!("rules[{}]", i))
                    .collect();
                if !wild.is_empty() {
                    out.push(Violation::new(
                        ViolationKind::WildcardPermission,
                        (*key).clone(),
                        format!("{} grants wildcard verbs or resources", wild.join(", ")),
                        now,
                    ));
                }
            }
            PolicyObject::RoleBinding(binding) => {
                let role_key = binding.role_key();
                let is_admin = objects
                    .get(&role_key)
                    .and_then(|o| o.as_role())
                    .is_some_and(|r| r.is_cluster_admin_equivalent());
                if is_admin {
                    let subjects: Vec<String> =
                        binding.subjects.iter().map(|s| s.principal_name()).collect();
                    out.push(Violation::new(
                        ViolationKind::ClusterAdminBinding,
                        (*key).clone(),
                        format!(
                            "binds cluster-admin-equivalent {} to {}",
                            role_key,
                            subjects.join(", ")
                        ),
                        now,
                    ));
                }
            }
            PolicyObject::NetworkPolicy(np) => {
                if !np.effective_policy_types().contains(&PolicyType::Ingress) {
                    continue;
                }
                let open: Vec<String> = np
                    .ingress
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.from.is_empty())
                    .map(|(i, _)| format!("ingress[{}]", i))
                    .collect();
                if !open.is_empty() {
                    out.push(Violation::new(
                        ViolationKind::UnscopedNetworkIngress,
                        (*key).clone(),
                        format!("{} admits traffic from any peer", open.join(", ")),
                        now,
                    ));
                }
            }
            PolicyObject::Namespace(_) => {}
        }
    }
    out
}

fn to_json(object: &PolicyObject) -> serde_json::Value {
    serde_json::to_value(object).unwrap_or_else(|e| {
        warn!("Cannot encode {} for diffing: {}", object.key(), e);
        serde_json::Value::Null
    })
}

/// Bindings written by the JIT controller come and go with their grants.
fn grant_owned(object: Option<&&PolicyObject>) -> bool {
    object
        .and_then(|o| o.as_binding())
        .is_some_and(|b| b.grant_id.is_some())
}

/// One violation per object added, removed or modified since `baseline`.
/// Grant bindings on either side are skipped.
fn drift(baseline: &Snapshot, current: &Snapshot, excluded: &BTreeSet<ObjectKey>, now: DateTime<Utc>) -> Vec<Violation> {
    let before = baseline.by_key();
    let after = current.by_key();
    let mut keys: BTreeSet<&ObjectKey> = before.keys().collect();
    keys.extend(after.keys());

    let mut out = Vec::new();
    for key in keys {
        if excluded.contains(key) || grant_owned(before.get(key)) || grant_owned(after.get(key)) {
            continue;
        }
        let (change, diff, message) = match (before.get(key), after.get(key)) {
            (Some(a), Some(b)) if a == b => continue,
            (Some(a), Some(b)) => {
                let diff = diff_values(&to_json(a), &to_json(b));
                let paths: Vec<&str> = diff.iter().map(|c| c.path.as_str()).collect();
                let message = format!("modified since baseline: {}", paths.join(", "));
                (DriftChange::Modified, diff, message)
            }
            (None, Some(b)) => (
                DriftChange::Added,
                vec![FieldChange {
                    path: String::new(),
                    before: None,
                    after: Some(to_json(b)),
                }],
                "added since baseline".to_string(),
            ),
            (Some(a), None) => (
                DriftChange::Removed,
                vec![FieldChange {
                    path: String::new(),
                    before: Some(to_json(a)),
                    after: None,
                }],
                "removed since baseline".to_string(),
            ),
            (None, None) => continue,
        };
        let mut violation = Violation::new(ViolationKind::ConfigurationDrift, key.clone(), message, now);
        violation.change = Some(change);
        violation.diff = diff;
        out.push(violation);
    }
    out
}
