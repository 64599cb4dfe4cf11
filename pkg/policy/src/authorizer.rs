use chrono::{DateTime, Utc};
use tracing::debug;

use pkg_metrics::{AUTHZ_DECISIONS, SharedMetrics};
use pkg_state::{PolicyStore, StoreState};
use pkg_types::clock::SharedClock;
use pkg_types::decision::{Decision, ReasonCode};
use pkg_types::request::{AccessRequest, Principal};
use pkg_types::Result;

use crate::audit::AccessLog;
use crate::context::EvalContext;
use crate::identity::IdentityResolver;
use crate::matcher::{matches_rule, matches_subject};

/// RBAC evaluator. Default deny: only a live binding whose role has a
/// matching rule produces an Allow.
#[derive(Clone)]
pub struct Authorizer {
    store: PolicyStore,
    clock: SharedClock,
    identity: IdentityResolver,
    access_log: AccessLog,
    metrics: Option<SharedMetrics>,
}

impl Authorizer {
    pub fn new(store: PolicyStore, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            identity: IdentityResolver::disabled(),
            access_log: AccessLog::new(),
            metrics: None,
        }
    }

    pub fn with_identity(mut self, identity: IdentityResolver) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_access_log(mut self, access_log: AccessLog) -> Self {
        self.access_log = access_log;
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn access_log(&self) -> &AccessLog {
        &self.access_log
    }

    /// Decide `request`. Never fails: evaluation errors become a Deny that
    /// carries the error kind as its reason.
    pub async fn authorize(&self, request: &AccessRequest, ctx: &EvalContext) -> Decision {
        self.access_log
            .record(&request.principal.name, self.clock.now())
            .await;

        let decision = match ctx.run(self.evaluate(request, ctx)).await.and_then(|r| r) {
            Ok(decision) => decision,
            Err(e) => Decision::from_error(&e),
        };

        debug!(
            principal = %request.principal.name,
            verb = %request.verb,
            resource = %request.resource,
            namespace = request.namespace.as_deref().unwrap_or(""),
            verdict = ?decision.verdict,
            reason = %decision.reason,
            "Authorization decision"
        );
        if let Some(metrics) = &self.metrics {
            let verdict = format!("{:?}", decision.verdict);
            let reason = decision.reason.to_string();
            metrics.counter_inc(AUTHZ_DECISIONS, &[("verdict", &verdict), ("reason", &reason)]);
        }
        decision
    }

    async fn evaluate(&self, request: &AccessRequest, ctx: &EvalContext) -> Result<Decision> {
        let principal = self.identity.resolve(&request.principal).await?;
        ctx.check()?;
        let now = self.clock.now();
        let state = self.store.read().await;
        Ok(evaluate_rbac(&state, &principal, request, now))
    }
}

/// Pure RBAC evaluation against one consistent store view.
///
/// Namespaced requests consider bindings in that namespace and cluster-wide
/// bindings; cluster-scoped requests consider only cluster-wide bindings.
pub fn evaluate_rbac(
    state: &StoreState,
    principal: &Principal,
    request: &AccessRequest,
    now: DateTime<Utc>,
) -> Decision {
    let namespaced = request
        .namespace
        .as_deref()
        .into_iter()
        .flat_map(|ns| state.bindings_in(Some(ns)));
    let candidates = namespaced.chain(state.bindings_in(None));

    for binding in candidates {
        if binding.is_expired(now) {
            continue;
        }
        if !binding.subjects.iter().any(|s| matches_subject(s, principal)) {
            continue;
        }
        let role_key = binding.role_key();
        let Some(role) = state.role(&role_key) else {
            continue;
        };
        if role.rules.iter().any(|rule| matches_rule(rule, request)) {
            return Decision::allow(
                ReasonCode::MatchedRule,
                format!(
                    "{} grants verb={} on resource={} via {}",
                    binding.key(),
                    request.verb,
                    request.resource,
                    role_key
                ),
            )
            .matched_by(binding.key());
        }
    }

    let scope = match &request.namespace {
        Some(ns) => format!("in namespace={}", ns),
        None => "cluster-wide".to_string(),
    };
    Decision::deny(
        ReasonCode::NoMatchingBinding,
        format!(
            "no RoleBinding grants verb={} on resource={} {}",
            request.verb, request.resource, scope
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::clock::{ManualClock, system_clock};
    use pkg_types::namespace::Namespace;
    use pkg_types::rbac::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
    use pkg_types::{ObjectKey, ObjectKind};
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    use crate::identity::IdentityResolver;
    use crate::identity::tests::SlowProvider;

    fn alice() -> Principal {
        Principal::new("alice")
    }

    async fn reader_store() -> PolicyStore {
        let store = PolicyStore::new();
        store
            .apply(vec![
                Namespace::new("ns-a").into(),
                Namespace::new("ns-b").into(),
                Role::namespaced("ns-a", "reader", vec![PolicyRule::new(["pods"], ["get", "list"])]).into(),
                RoleBinding::namespaced("ns-a", "alice-reader", RoleRef::role("reader"), vec![Subject::user("alice")])
                    .into(),
            ])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn reader_scenario() {
        let authz = Authorizer::new(reader_store().await, system_clock());
        let ctx = EvalContext::background();

        let get = AccessRequest::new(alice(), "get", "pods").in_namespace("ns-a");
        let d = authz.authorize(&get, &ctx).await;
        assert!(d.is_allowed());
        assert_eq!(d.reason, ReasonCode::MatchedRule);
        assert_eq!(
            d.matched_by,
            Some(ObjectKey::namespaced(ObjectKind::RoleBinding, "ns-a", "alice-reader"))
        );

        let delete = AccessRequest::new(alice(), "delete", "pods").in_namespace("ns-a");
        let d = authz.authorize(&delete, &ctx).await;
        assert!(!d.is_allowed());
        assert_eq!(d.reason, ReasonCode::NoMatchingBinding);
        assert_eq!(
            d.message,
            "no RoleBinding grants verb=delete on resource=pods in namespace=ns-a"
        );

        let other_ns = AccessRequest::new(alice(), "get", "pods").in_namespace("ns-b");
        assert!(!authz.authorize(&other_ns, &ctx).await.is_allowed());

        let bob = AccessRequest::new(Principal::new("bob"), "get", "pods").in_namespace("ns-a");
        assert!(!authz.authorize(&bob, &ctx).await.is_allowed());
    }

    #[tokio::test]
    async fn group_and_cluster_bindings() {
        let store = reader_store().await;
        store
            .apply(vec![
                Role::cluster("view", vec![PolicyRule::new(["configmaps"], ["get"])]).into(),
                RoleBinding::cluster("sre-view", "view", vec![Subject::group("sre")]).into(),
            ])
            .await
            .unwrap();
        let authz = Authorizer::new(store, system_clock());
        let ctx = EvalContext::background();

        let sre = Principal::new("carol").in_group("sre");
        for ns in ["ns-a", "ns-b"] {
            let req = AccessRequest::new(sre.clone(), "get", "configmaps").in_namespace(ns);
            assert!(authz.authorize(&req, &ctx).await.is_allowed());
        }
        let cluster_req = AccessRequest::new(sre, "get", "configmaps");
        assert!(authz.authorize(&cluster_req, &ctx).await.is_allowed());

        // Namespaced bindings never grant cluster-scoped access.
        let cluster_pods = AccessRequest::new(alice(), "get", "pods");
        let d = authz.authorize(&cluster_pods, &ctx).await;
        assert!(!d.is_allowed());
        assert!(d.message.ends_with("cluster-wide"));
    }

    #[tokio::test]
    async fn expired_binding_stops_granting() {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let store = PolicyStore::with_clock(clock.clone());
        let mut binding =
            RoleBinding::namespaced("ns-a", "temp", RoleRef::role("reader"), vec![Subject::user("dave")]);
        binding.expires_at = Some(start + chrono::Duration::seconds(10));
        store
            .apply(vec![
                Namespace::new("ns-a").into(),
                Role::namespaced("ns-a", "reader", vec![PolicyRule::new(["pods"], ["get"])]).into(),
                binding.into(),
            ])
            .await
            .unwrap();
        let authz = Authorizer::new(store, clock.clone());
        let req = AccessRequest::new(Principal::new("dave"), "get", "pods").in_namespace("ns-a");
        let ctx = EvalContext::background();

        assert!(authz.authorize(&req, &ctx).await.is_allowed());
        clock.advance(chrono::Duration::seconds(10));
        assert!(!authz.authorize(&req, &ctx).await.is_allowed());
    }

    #[tokio::test]
    async fn cancellation_fails_closed() {
        let authz = Authorizer::new(reader_store().await, system_clock());
        let token = CancellationToken::new();
        token.cancel();
        let ctx = EvalContext::background().with_cancel(token);
        let req = AccessRequest::new(alice(), "get", "pods").in_namespace("ns-a");
        let d = authz.authorize(&req, &ctx).await;
        assert!(!d.is_allowed());
        assert_eq!(d.reason, ReasonCode::Canceled);
    }

    #[tokio::test]
    async fn identity_timeout_fails_closed() {
        let authz = Authorizer::new(reader_store().await, system_clock())
            .with_identity(IdentityResolver::new(Arc::new(SlowProvider), Duration::from_millis(20)));
        let req = AccessRequest::new(alice(), "get", "pods").in_namespace("ns-a");
        let d = authz.authorize(&req, &EvalContext::background()).await;
        assert!(!d.is_allowed());
        assert_eq!(d.reason, ReasonCode::IdentityTimeout);
    }

    #[tokio::test]
    async fn queries_are_logged_and_counted() {
        let metrics = Arc::new(pkg_metrics::MetricsRegistry::with_defaults());
        let authz = Authorizer::new(reader_store().await, system_clock()).with_metrics(metrics.clone());
        let req = AccessRequest::new(Principal::new("erin"), "get", "pods").in_namespace("ns-a");
        authz.authorize(&req, &EvalContext::background()).await;

        assert!(authz.access_log().last_query("erin").await.is_some());
        assert_eq!(
            metrics.counter_value(
                AUTHZ_DECISIONS,
                &[("verdict", "Deny"), ("reason", "NoMatchingBinding")]
            ),
            Some(1)
        );
    }

    proptest! {
        /// Bindings for other principals never grant alice anything.
        #[test]
        fn unrelated_bindings_never_allow(
            others in proptest::collection::btree_set("[b-z][a-z]{2,8}", 0..8),
            verb in "[a-z]{3,8}",
            resource in "[a-z]{3,10}",
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let decision = rt.block_on(async {
                let store = PolicyStore::new();
                let mut objects = vec![
                    Namespace::new("ns-a").into(),
                    Role::namespaced("ns-a", "admin", vec![PolicyRule::new(["*"], ["*"])]).into(),
                ];
                for (i, name) in others.iter().enumerate() {
                    objects.push(
                        RoleBinding::namespaced(
                            "ns-a",
                            format!("b{}", i),
                            RoleRef::role("admin"),
                            vec![Subject::user(name.clone())],
                        )
                        .into(),
                    );
                }
                store.apply(objects).await.unwrap();
                let authz = Authorizer::new(store, system_clock());
                let req = AccessRequest::new(alice(), verb, resource).in_namespace("ns-a");
                authz.authorize(&req, &EvalContext::background()).await
            });
            prop_assert!(!decision.is_allowed());
            prop_assert_eq!(decision.reason, ReasonCode::NoMatchingBinding);
        }
    }
}
