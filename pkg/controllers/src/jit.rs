use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use pkg_compliance::GrantLedger;
use pkg_constants::jit::{DEFAULT_GRANT_RETENTION_SECS, DEFAULT_MAX_GRANT_DURATION_SECS, SWEEPER_ACTOR};
use pkg_metrics::{ACTIVE_GRANTS, GRANT_TRANSITIONS, SharedMetrics};
use pkg_state::PolicyStore;
use pkg_types::clock::SharedClock;
use pkg_types::grant::{AccessGrant, GrantState};
use pkg_types::rbac::{RoleBinding, RoleRef, Subject};
use pkg_types::{ObjectKey, ObjectKind, PolicyError, PolicyObject, Result};

/// Actor recorded when a grant is approved because its role needs no approval.
const AUTO_APPROVER: &str = "system:auto-approve";

/// Input of [`JitController::request_grant`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantRequest {
    pub principal: String,
    pub role_ref: RoleRef,
    pub namespace: String,
    pub duration_secs: u64,
    #[serde(default)]
    pub justification: String,
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepStats {
    pub expired: usize,
    pub revoked: usize,
    pub bindings_deleted: usize,
    pub pruned: usize,
}

/// Owner of just-in-time access grants.
///
/// Grants live here; the RoleBindings they produce live in the policy store
/// and carry the grant id. Every transition holds the grant table's write
/// lock, so an approval, a revocation and a sweep never interleave on the
/// same grant.
#[derive(Clone)]
pub struct JitController {
    store: PolicyStore,
    clock: SharedClock,
    grants: Arc<RwLock<BTreeMap<String, AccessGrant>>>,
    max_duration_secs: u64,
    retention: chrono::Duration,
    metrics: Option<SharedMetrics>,
}

impl JitController {
    pub fn new(store: PolicyStore, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            grants: Arc::new(RwLock::new(BTreeMap::new())),
            max_duration_secs: DEFAULT_MAX_GRANT_DURATION_SECS,
            retention: chrono::Duration::seconds(DEFAULT_GRANT_RETENTION_SECS as i64),
            metrics: None,
        }
    }

    pub fn with_max_duration_secs(mut self, secs: u64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    /// How long terminal grants stay queryable after their last transition.
    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &PolicyStore {
        &self.store
    }

    /// Open a grant. Roles that do not require approval are approved and
    /// activated in the same call.
    pub async fn request_grant(&self, request: GrantRequest) -> Result<AccessGrant> {
        let id = Uuid::new_v4().to_string();
        let pending = ObjectKey::namespaced(ObjectKind::AccessGrant, &request.namespace, &id);
        if request.principal.trim().is_empty() {
            return Err(PolicyError::invalid(&pending, "principal", "must not be empty"));
        }
        if request.duration_secs == 0 || request.duration_secs > self.max_duration_secs {
            return Err(PolicyError::invalid(
                &pending,
                "durationSecs",
                format!("must be between 1 and {} seconds", self.max_duration_secs),
            ));
        }

        let mut grants = self.grants.write().await;
        let requires_approval = {
            let state = self.store.read().await;
            if state.namespace(&request.namespace).is_none() {
                return Err(PolicyError::InvalidTarget {
                    target: ObjectKey::namespace(&request.namespace),
                });
            }
            let role_key = request.role_ref.resolve(Some(&request.namespace));
            match state.role(&role_key) {
                Some(role) => role.metadata.requires_approval,
                None => return Err(PolicyError::InvalidTarget { target: role_key }),
            }
        };

        let now = self.clock.now();
        let mut grant = AccessGrant {
            id: id.clone(),
            principal: request.principal.clone(),
            role_ref: request.role_ref,
            namespace: request.namespace,
            duration_secs: request.duration_secs,
            justification: request.justification,
            requires_approval,
            state: GrantState::Requested,
            requested_at: now,
            approved_by: None,
            activated_at: None,
            expires_at: None,
            history: Vec::new(),
        };
        let note = (!grant.justification.is_empty()).then(|| grant.justification.clone());
        grant.record(GrantState::Requested, &request.principal, now, note);
        info!(
            "Grant {} requested by {} for {:?} {} in {}",
            grant.id, grant.principal, grant.role_ref.kind, grant.role_ref.name, grant.namespace
        );
        self.count_transition(GrantState::Requested);

        if !requires_approval {
            grant.approved_by = Some(AUTO_APPROVER.to_string());
            grant.record(GrantState::Approved, AUTO_APPROVER, now, None);
            self.count_transition(GrantState::Approved);
            self.activate(&mut grant, AUTO_APPROVER, now).await?;
        }

        grants.insert(id, grant.clone());
        self.update_active_gauge(&grants);
        Ok(grant)
    }

    /// Approve a requested grant; approval activates it immediately.
    /// Approving an already approved or active grant is a no-op.
    pub async fn approve_grant(&self, id: &str, approver: &str) -> Result<AccessGrant> {
        let mut grants = self.grants.write().await;
        let current = grants
            .get(id)
            .ok_or_else(|| PolicyError::GrantNotFound(id.to_string()))?;
        match current.state {
            GrantState::Approved | GrantState::Active => return Ok(current.clone()),
            GrantState::Expired | GrantState::Revoked => {
                return Err(PolicyError::invalid(
                    &current.key(),
                    "state",
                    format!("grant is {} and cannot be approved", current.state),
                ));
            }
            GrantState::Requested => {}
        }
        if current.requires_approval && current.principal == approver {
            return Err(PolicyError::SelfApproval {
                grant: id.to_string(),
                approver: approver.to_string(),
            });
        }

        let mut grant = current.clone();
        let now = self.clock.now();
        grant.approved_by = Some(approver.to_string());
        grant.record(GrantState::Approved, approver, now, None);
        self.activate(&mut grant, approver, now).await?;
        self.count_transition(GrantState::Approved);
        info!("Grant {} approved by {}", grant.id, approver);

        grants.insert(grant.id.clone(), grant.clone());
        self.update_active_gauge(&grants);
        Ok(grant)
    }

    /// Cancel or revoke a grant. Revoking an expired or revoked grant is a
    /// no-op.
    pub async fn revoke_grant(&self, id: &str, actor: &str) -> Result<AccessGrant> {
        let mut grants = self.grants.write().await;
        let grant = grants
            .get_mut(id)
            .ok_or_else(|| PolicyError::GrantNotFound(id.to_string()))?;
        if grant.state.is_terminal() {
            return Ok(grant.clone());
        }
        self.store.delete(&grant.binding_key()).await?;
        grant.record(GrantState::Revoked, actor, self.clock.now(), None);
        info!("Grant {} revoked by {}", grant.id, actor);
        let revoked = grant.clone();
        self.count_transition(GrantState::Revoked);
        self.update_active_gauge(&grants);
        Ok(revoked)
    }

    pub async fn get_grant(&self, id: &str) -> Result<AccessGrant> {
        self.grants
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PolicyError::GrantNotFound(id.to_string()))
    }

    /// Every grant, optionally restricted to one namespace.
    pub async fn list_grants(&self, namespace: Option<&str>) -> Vec<AccessGrant> {
        self.grants
            .read()
            .await
            .values()
            .filter(|g| namespace.is_none_or(|ns| g.namespace == ns))
            .cloned()
            .collect()
    }

    pub async fn list_active_grants(&self, namespace: Option<&str>) -> Vec<AccessGrant> {
        self.grants
            .read()
            .await
            .values()
            .filter(|g| g.state == GrantState::Active)
            .filter(|g| namespace.is_none_or(|ns| g.namespace == ns))
            .cloned()
            .collect()
    }

    /// Grants with audit events in `[from, to]`.
    pub async fn history(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<AccessGrant> {
        self.grants
            .read()
            .await
            .values()
            .filter(|g| g.touched_between(from, to))
            .cloned()
            .collect()
    }

    /// One expiry pass: expire due grants, drop any other expired binding,
    /// and revoke grants whose namespace or binding vanished. Terminal
    /// grants past the retention window are forgotten.
    pub async fn sweep(&self) -> Result<SweepStats> {
        let mut grants = self.grants.write().await;
        let now = self.clock.now();
        let mut stats = SweepStats::default();

        for grant in grants.values_mut() {
            if grant.state.is_terminal() {
                continue;
            }
            let (namespace_exists, binding_exists) = {
                let state = self.store.read().await;
                (
                    state.namespace(&grant.namespace).is_some(),
                    state.contains(&grant.binding_key()),
                )
            };

            let outcome = if grant.state == GrantState::Active && grant.expires_at.is_some_and(|at| at <= now) {
                Some((GrantState::Expired, None))
            } else if !namespace_exists {
                Some((GrantState::Revoked, Some("namespace deleted".to_string())))
            } else if grant.state == GrantState::Active && !binding_exists {
                Some((GrantState::Revoked, Some("binding removed".to_string())))
            } else {
                None
            };
            let Some((state, note)) = outcome else {
                continue;
            };

            if self.store.delete(&grant.binding_key()).await?.is_some() {
                stats.bindings_deleted += 1;
            }
            grant.record(state, SWEEPER_ACTOR, now, note);
            self.count_transition(state);
            match state {
                GrantState::Expired => {
                    stats.expired += 1;
                    info!("Grant {} for {} expired", grant.id, grant.principal);
                }
                _ => {
                    stats.revoked += 1;
                    warn!(
                        "Grant {} for {} revoked by sweeper: {}",
                        grant.id,
                        grant.principal,
                        grant.history.last().and_then(|e| e.note.as_deref()).unwrap_or("")
                    );
                }
            }
        }

        let expired_bindings: Vec<ObjectKey> = self
            .store
            .read()
            .await
            .bindings()
            .filter(|b| b.is_expired(now))
            .map(RoleBinding::key)
            .collect();
        for key in expired_bindings {
            if self.store.delete(&key).await?.is_some() {
                info!("Deleted expired binding {}", key);
                stats.bindings_deleted += 1;
            }
        }

        let cutoff = now - self.retention;
        let before = grants.len();
        grants.retain(|_, g| !g.state.is_terminal() || g.history.last().is_none_or(|e| e.at > cutoff));
        stats.pruned = before - grants.len();

        self.update_active_gauge(&grants);
        Ok(stats)
    }

    /// Create the grant's binding and mark it Active.
    async fn activate(&self, grant: &mut AccessGrant, actor: &str, now: DateTime<Utc>) -> Result<()> {
        let expires_at = now + chrono::Duration::seconds(grant.duration_secs as i64);
        let mut binding = RoleBinding::namespaced(
            &grant.namespace,
            grant.binding_name(),
            grant.role_ref.clone(),
            vec![Subject::user(&grant.principal)],
        );
        binding.expires_at = Some(expires_at);
        binding.grant_id = Some(grant.id.clone());
        self.store.put(PolicyObject::RoleBinding(binding)).await?;

        grant.activated_at = Some(now);
        grant.expires_at = Some(expires_at);
        grant.record(GrantState::Active, actor, now, None);
        self.count_transition(GrantState::Active);
        info!(
            "Grant {} active for {} until {}",
            grant.id,
            grant.principal,
            expires_at.to_rfc3339()
        );
        Ok(())
    }

    fn count_transition(&self, state: GrantState) {
        if let Some(metrics) = &self.metrics {
            let state = state.to_string();
            metrics.counter_inc(GRANT_TRANSITIONS, &[("state", &state)]);
        }
    }

    fn update_active_gauge(&self, grants: &BTreeMap<String, AccessGrant>) {
        if let Some(metrics) = &self.metrics {
            let active = grants.values().filter(|g| g.state == GrantState::Active).count();
            metrics.gauge_set(ACTIVE_GRANTS, &[], active as i64);
        }
    }
}

#[async_trait]
impl GrantLedger for JitController {
    async fn active_grants(&self) -> Vec<AccessGrant> {
        self.list_active_grants(None).await
    }

    async fn grants_touched_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<AccessGrant> {
        self.history(from, to).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_policy::{Authorizer, EvalContext};
    use pkg_compliance::DriftDetector;
    use pkg_policy::AccessLog;
    use pkg_types::clock::{Clock, ManualClock};
    use pkg_types::violation::ViolationKind;
    use pkg_types::namespace::Namespace;
    use pkg_types::rbac::{PolicyRule, Role};
    use pkg_types::request::{AccessRequest, Principal};

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    async fn setup() -> (JitController, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let store = PolicyStore::with_clock(clock.clone());
        store
            .apply(vec![
                Namespace::new("prod").into(),
                Role::namespaced("prod", "debugger", vec![PolicyRule::new(["pods/exec"], ["create"])]).into(),
                Role::namespaced("prod", "db-admin", vec![PolicyRule::new(["databases"], ["*"])])
                    .requiring_approval()
                    .into(),
            ])
            .await
            .unwrap();
        (JitController::new(store, clock.clone()), clock)
    }

    fn request(role: &str, duration_secs: u64) -> GrantRequest {
        GrantRequest {
            principal: "alice".to_string(),
            role_ref: RoleRef::role(role),
            namespace: "prod".to_string(),
            duration_secs,
            justification: "INC-42".to_string(),
        }
    }

    fn exec_request() -> AccessRequest {
        AccessRequest::new(Principal::new("alice"), "create", "pods/exec").in_namespace("prod")
    }

    #[tokio::test]
    async fn invalid_targets_are_rejected() {
        let (jit, _) = setup().await;
        let err = jit.request_grant(request("ghost", 60)).await.unwrap_err();
        assert_eq!(err.code(), "ErrInvalidTarget");

        let mut wrong_ns = request("debugger", 60);
        wrong_ns.namespace = "staging".to_string();
        let err = jit.request_grant(wrong_ns).await.unwrap_err();
        assert_eq!(
            err,
            PolicyError::InvalidTarget {
                target: ObjectKey::namespace("staging")
            }
        );

        for duration in [0, DEFAULT_MAX_GRANT_DURATION_SECS + 1] {
            let err = jit.request_grant(request("debugger", duration)).await.unwrap_err();
            assert_eq!(err.code(), "ErrInvalidObject");
        }
        assert!(jit.list_grants(None).await.is_empty());
    }

    #[tokio::test]
    async fn auto_approved_grant_allows_until_swept() {
        let (jit, clock) = setup().await;
        let authz = Authorizer::new(jit.store().clone(), clock.clone());
        let ctx = EvalContext::background();
        assert!(!authz.authorize(&exec_request(), &ctx).await.is_allowed());

        let grant = jit.request_grant(request("debugger", 900)).await.unwrap();
        assert_eq!(grant.state, GrantState::Active);
        assert_eq!(grant.expires_at, Some(start() + chrono::Duration::seconds(900)));
        let states: Vec<GrantState> = grant.history.iter().map(|e| e.state).collect();
        assert_eq!(states, vec![GrantState::Requested, GrantState::Approved, GrantState::Active]);
        assert!(authz.authorize(&exec_request(), &ctx).await.is_allowed());

        let binding = jit.store().get(&grant.binding_key()).await.unwrap();
        assert_eq!(binding.as_binding().unwrap().grant_id.as_deref(), Some(grant.id.as_str()));

        clock.advance(chrono::Duration::seconds(900));
        let stats = jit.sweep().await.unwrap();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.bindings_deleted, 1);
        assert_eq!(jit.get_grant(&grant.id).await.unwrap().state, GrantState::Expired);
        assert!(jit.store().get(&grant.binding_key()).await.is_none());
        assert!(!authz.authorize(&exec_request(), &ctx).await.is_allowed());
        assert!(jit.list_active_grants(Some("prod")).await.is_empty());
    }

    #[tokio::test]
    async fn approval_flow() {
        let (jit, _) = setup().await;
        let grant = jit.request_grant(request("db-admin", 600)).await.unwrap();
        assert_eq!(grant.state, GrantState::Requested);
        assert!(jit.store().get(&grant.binding_key()).await.is_none());

        let err = jit.approve_grant(&grant.id, "alice").await.unwrap_err();
        assert_eq!(err.code(), "ErrSelfApproval");

        let approved = jit.approve_grant(&grant.id, "bob").await.unwrap();
        assert_eq!(approved.state, GrantState::Active);
        assert_eq!(approved.approved_by.as_deref(), Some("bob"));
        assert!(jit.store().get(&grant.binding_key()).await.is_some());

        let again = jit.approve_grant(&grant.id, "carol").await.unwrap();
        assert_eq!(again.history.len(), approved.history.len());
        assert_eq!(again.approved_by.as_deref(), Some("bob"));

        let err = jit.approve_grant("nope", "bob").await.unwrap_err();
        assert_eq!(err.code(), "ErrGrantNotFound");
    }

    #[tokio::test]
    async fn revoke_is_idempotent() {
        let (jit, clock) = setup().await;
        let grant = jit.request_grant(request("debugger", 60)).await.unwrap();

        let revoked = jit.revoke_grant(&grant.id, "security").await.unwrap();
        assert_eq!(revoked.state, GrantState::Revoked);
        assert!(jit.store().get(&grant.binding_key()).await.is_none());
        let again = jit.revoke_grant(&grant.id, "security").await.unwrap();
        assert_eq!(again.history.len(), revoked.history.len());

        let other = jit.request_grant(request("debugger", 60)).await.unwrap();
        clock.advance(chrono::Duration::seconds(61));
        jit.sweep().await.unwrap();
        let after = jit.revoke_grant(&other.id, "security").await.unwrap();
        assert_eq!(after.state, GrantState::Expired);

        let err = jit.revoke_grant("missing", "security").await.unwrap_err();
        assert_eq!(err.code(), "ErrGrantNotFound");
        assert!(matches!(
            jit.approve_grant(&grant.id, "bob").await,
            Err(PolicyError::InvalidObject { .. })
        ));
    }

    #[tokio::test]
    async fn sweep_revokes_grants_whose_targets_vanished() {
        let (jit, _) = setup().await;
        let pending = jit.request_grant(request("db-admin", 60)).await.unwrap();
        let active = jit.request_grant(request("debugger", 60)).await.unwrap();

        // Out-of-band binding deletion.
        jit.store().delete(&active.binding_key()).await.unwrap();
        let stats = jit.sweep().await.unwrap();
        assert_eq!(stats.revoked, 1);
        let revoked = jit.get_grant(&active.id).await.unwrap();
        assert_eq!(revoked.state, GrantState::Revoked);
        assert_eq!(revoked.history.last().unwrap().note.as_deref(), Some("binding removed"));
        assert_eq!(jit.get_grant(&pending.id).await.unwrap().state, GrantState::Requested);

        jit.store().delete(&ObjectKey::namespace("prod")).await.unwrap();
        let stats = jit.sweep().await.unwrap();
        assert_eq!(stats.revoked, 1);
        let gone = jit.get_grant(&pending.id).await.unwrap();
        assert_eq!(gone.state, GrantState::Revoked);
        assert_eq!(gone.history.last().unwrap().actor, SWEEPER_ACTOR);
    }

    #[tokio::test]
    async fn sweep_deletes_plain_expired_bindings() {
        let (jit, clock) = setup().await;
        let mut binding = RoleBinding::namespaced(
            "prod",
            "contractor",
            RoleRef::role("debugger"),
            vec![Subject::user("zed")],
        );
        binding.expires_at = Some(start() + chrono::Duration::seconds(30));
        jit.store().put(binding.clone()).await.unwrap();

        assert_eq!(jit.sweep().await.unwrap(), SweepStats::default());
        clock.advance(chrono::Duration::seconds(30));
        let stats = jit.sweep().await.unwrap();
        assert_eq!(stats.bindings_deleted, 1);
        assert!(jit.store().get(&binding.key()).await.is_none());
    }

    #[tokio::test]
    async fn history_covers_period() {
        let (jit, clock) = setup().await;
        jit.request_grant(request("debugger", 60)).await.unwrap();
        clock.advance(chrono::Duration::hours(2));
        let later = jit.request_grant(request("debugger", 60)).await.unwrap();

        let recent = jit
            .history(clock.now() - chrono::Duration::minutes(5), clock.now())
            .await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, later.id);
        assert_eq!(jit.active_grants().await.len(), 2);
    }

    #[tokio::test]
    async fn terminal_grants_are_pruned_after_retention() {
        let (jit, clock) = setup().await;
        let jit = jit.with_retention(chrono::Duration::hours(1));
        let done = jit.request_grant(request("debugger", 60)).await.unwrap();
        jit.revoke_grant(&done.id, "security").await.unwrap();
        let pending = jit.request_grant(request("db-admin", 60)).await.unwrap();

        clock.advance(chrono::Duration::minutes(30));
        assert_eq!(jit.sweep().await.unwrap().pruned, 0);
        assert!(jit.get_grant(&done.id).await.is_ok());

        clock.advance(chrono::Duration::minutes(31));
        assert_eq!(jit.sweep().await.unwrap().pruned, 1);
        assert_eq!(jit.get_grant(&done.id).await.unwrap_err().code(), "ErrGrantNotFound");
        assert_eq!(jit.get_grant(&pending.id).await.unwrap().state, GrantState::Requested);
    }

    #[tokio::test]
    async fn expiry_after_baseline_is_not_drift() {
        let (jit, clock) = setup().await;
        let detector = DriftDetector::new(jit.store().clone(), clock.clone(), AccessLog::new())
            .with_grants(Arc::new(jit.clone()));
        jit.request_grant(request("debugger", 60)).await.unwrap();
        detector.take_baseline().await;

        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(jit.sweep().await.unwrap().expired, 1);
        let drift: Vec<_> = detector
            .scan()
            .await
            .into_iter()
            .filter(|v| v.kind == ViolationKind::ConfigurationDrift)
            .collect();
        assert!(drift.is_empty(), "unexpected drift: {:?}", drift);
    }
}
