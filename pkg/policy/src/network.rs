use std::collections::BTreeMap;
use tracing::debug;

use pkg_metrics::{NETWORK_DECISIONS, SharedMetrics};
use pkg_state::{PolicyStore, StoreState};
use pkg_types::decision::{Decision, ReasonCode};
use pkg_types::network_policy::{CompiledPeer, CompiledRule, PolicyType, Protocol};
use pkg_types::request::{NetworkFlow, Workload};

use crate::context::EvalContext;
use crate::matcher::{matches_port, matches_selector};

/// Network isolation evaluator.
///
/// A workload no policy selects (for the flow's direction) is open. Once any
/// policy selects it, only traffic admitted by some rule of some selecting
/// policy passes; rules across policies are unioned.
#[derive(Clone)]
pub struct NetworkEvaluator {
    store: PolicyStore,
    metrics: Option<SharedMetrics>,
}

impl NetworkEvaluator {
    pub fn new(store: PolicyStore) -> Self {
        Self { store, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn is_allowed(&self, flow: &NetworkFlow) -> bool {
        self.check(flow, &EvalContext::background()).await.is_allowed()
    }

    pub async fn check(&self, flow: &NetworkFlow, ctx: &EvalContext) -> Decision {
        let result = ctx
            .run(async {
                let state = self.store.read().await;
                evaluate_flow(&state, flow)
            })
            .await;
        let decision = result.unwrap_or_else(|e| Decision::from_error(&e));

        debug!(
            source = %describe(&flow.source),
            destination = %describe(&flow.destination),
            port = flow.port,
            protocol = %flow.protocol,
            direction = %flow.direction,
            verdict = ?decision.verdict,
            reason = %decision.reason,
            "Network decision"
        );
        if let Some(metrics) = &self.metrics {
            let verdict = format!("{:?}", decision.verdict);
            let reason = decision.reason.to_string();
            metrics.counter_inc(NETWORK_DECISIONS, &[("verdict", &verdict), ("reason", &reason)]);
        }
        decision
    }
}

/// `ns[k=v,...]`, for messages.
fn describe(workload: &Workload) -> String {
    let labels: Vec<String> = workload
        .labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    format!("{}[{}]", workload.namespace, labels.join(","))
}

fn peer_matches(peer: &CompiledPeer, policy_namespace: &str, other: &Workload, state: &StoreState) -> bool {
    let namespace_ok = match &peer.namespace_selector {
        None => other.namespace == policy_namespace,
        Some(selector) => match state.namespace(&other.namespace) {
            Some(ns) => matches_selector(selector, &ns.labels),
            None => matches_selector(selector, &BTreeMap::new()),
        },
    };
    namespace_ok
        && peer
            .pod_selector
            .as_ref()
            .is_none_or(|s| matches_selector(s, &other.labels))
}

fn rule_admits(
    rule: &CompiledRule,
    policy_namespace: &str,
    other: &Workload,
    port: u16,
    protocol: Protocol,
    state: &StoreState,
) -> bool {
    let peer_ok = rule.peers.is_empty()
        || rule
            .peers
            .iter()
            .any(|p| peer_matches(p, policy_namespace, other, state));
    let port_ok = rule.ports.is_empty() || rule.ports.iter().any(|p| matches_port(p, port, protocol));
    peer_ok && port_ok
}

/// Pure evaluation of one flow against one consistent store view.
pub fn evaluate_flow(state: &StoreState, flow: &NetworkFlow) -> Decision {
    let direction = flow.direction;
    let (subject, other) = match direction {
        PolicyType::Ingress => (&flow.destination, &flow.source),
        PolicyType::Egress => (&flow.source, &flow.destination),
    };

    let mut selecting = 0usize;
    for policy in state.network_policies_in(&subject.namespace) {
        let Some(rules) = policy.rules(direction) else {
            continue;
        };
        if !matches_selector(&policy.pod_selector, &subject.labels) {
            continue;
        }
        selecting += 1;
        if rules
            .iter()
            .any(|r| rule_admits(r, &policy.namespace, other, flow.port, flow.protocol, state))
        {
            return Decision::allow(
                ReasonCode::MatchedNetworkRule,
                format!(
                    "{} admits {} traffic from {} to {} on {}/{}",
                    policy.key,
                    direction,
                    describe(&flow.source),
                    describe(&flow.destination),
                    flow.port,
                    flow.protocol
                ),
            )
            .matched_by(policy.key.clone());
        }
    }

    if selecting == 0 {
        return Decision::allow(
            ReasonCode::NoSelectingPolicy,
            format!(
                "no NetworkPolicy selects {} for {}",
                describe(subject),
                direction
            ),
        );
    }
    Decision::deny(
        ReasonCode::NoMatchingNetworkRule,
        format!(
            "{} NetworkPolicy(s) select {} for {} but none admits {} on {}/{}",
            selecting,
            describe(subject),
            direction,
            describe(other),
            flow.port,
            flow.protocol
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::namespace::Namespace;
    use pkg_types::network_policy::{EgressRule, IngressRule, NetworkPolicy, NetworkPolicyPeer, NetworkPolicyPort};
    use pkg_types::selector::LabelSelector;
    use proptest::prelude::*;
    use tokio_util::sync::CancellationToken;

    fn flow(src: Workload, dst: Workload, port: u16, direction: PolicyType) -> NetworkFlow {
        NetworkFlow {
            source: src,
            destination: dst,
            port,
            protocol: Protocol::Tcp,
            direction,
        }
    }

    fn pod(ns: &str, app: &str) -> Workload {
        Workload::new(ns, [("app", app)])
    }

    fn db_policy() -> NetworkPolicy {
        let mut np = NetworkPolicy::new("ns-b", "db-from-api", LabelSelector::labels([("app", "db")]));
        np.ingress.push(IngressRule {
            from: vec![NetworkPolicyPeer::pods(LabelSelector::labels([("app", "api")]))],
            ports: vec![NetworkPolicyPort::tcp(5432)],
        });
        np
    }

    async fn db_store() -> PolicyStore {
        let store = PolicyStore::new();
        store
            .apply(vec![
                Namespace::new("ns-b").into(),
                Namespace::new("ns-c").into(),
                db_policy().into(),
            ])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn database_scenario() {
        let eval = NetworkEvaluator::new(db_store().await);
        let api = pod("ns-b", "api");
        let db = pod("ns-b", "db");

        let d = eval
            .check(&flow(api.clone(), db.clone(), 5432, PolicyType::Ingress), &EvalContext::background())
            .await;
        assert!(d.is_allowed());
        assert_eq!(d.reason, ReasonCode::MatchedNetworkRule);

        assert!(!eval.is_allowed(&flow(api.clone(), db.clone(), 5433, PolicyType::Ingress)).await);
        assert!(!eval.is_allowed(&flow(pod("ns-b", "web"), db.clone(), 5432, PolicyType::Ingress)).await);
        // Pod-selector-only peers are confined to the policy's namespace.
        assert!(!eval.is_allowed(&flow(pod("ns-c", "api"), db.clone(), 5432, PolicyType::Ingress)).await);

        let mut udp = flow(api.clone(), db.clone(), 5432, PolicyType::Ingress);
        udp.protocol = Protocol::Udp;
        let d = eval.check(&udp, &EvalContext::background()).await;
        assert_eq!(d.reason, ReasonCode::NoMatchingNetworkRule);

        // The db's own egress is not governed.
        let d = eval
            .check(&flow(db, api, 80, PolicyType::Egress), &EvalContext::background())
            .await;
        assert!(d.is_allowed());
        assert_eq!(d.reason, ReasonCode::NoSelectingPolicy);
    }

    #[tokio::test]
    async fn policies_are_additive() {
        let store = db_store().await;
        let mut metrics_np = NetworkPolicy::new("ns-b", "db-from-metrics", LabelSelector::labels([("app", "db")]));
        metrics_np.ingress.push(IngressRule {
            from: vec![NetworkPolicyPeer::pods(LabelSelector::labels([("app", "metrics")]))],
            ports: vec![],
        });
        store.put(metrics_np).await.unwrap();
        let eval = NetworkEvaluator::new(store);
        let db = pod("ns-b", "db");

        assert!(eval.is_allowed(&flow(pod("ns-b", "api"), db.clone(), 5432, PolicyType::Ingress)).await);
        assert!(eval.is_allowed(&flow(pod("ns-b", "metrics"), db.clone(), 9187, PolicyType::Ingress)).await);
        assert!(!eval.is_allowed(&flow(pod("ns-b", "web"), db, 5432, PolicyType::Ingress)).await);
    }

    #[tokio::test]
    async fn empty_rules_isolate_and_empty_peers_admit_all() {
        let store = PolicyStore::new();
        let deny_all = NetworkPolicy::new("ns-a", "deny-all", LabelSelector::everything());
        let mut open = NetworkPolicy::new("ns-a", "open-web", LabelSelector::labels([("app", "web")]));
        open.ingress.push(IngressRule::default());
        store
            .apply(vec![Namespace::new("ns-a").into(), deny_all.into(), open.into()])
            .await
            .unwrap();
        let eval = NetworkEvaluator::new(store);

        assert!(!eval.is_allowed(&flow(pod("ns-a", "x"), pod("ns-a", "api"), 80, PolicyType::Ingress)).await);
        assert!(eval.is_allowed(&flow(pod("elsewhere", "x"), pod("ns-a", "web"), 80, PolicyType::Ingress)).await);
    }

    #[tokio::test]
    async fn namespace_selector_peers() {
        let store = PolicyStore::new();
        let mut np = NetworkPolicy::new("ns-a", "from-monitoring", LabelSelector::everything());
        np.ingress.push(IngressRule {
            from: vec![NetworkPolicyPeer {
                pod_selector: Some(LabelSelector::labels([("app", "prom")])),
                namespace_selector: Some(LabelSelector::labels([("team", "obs")])),
            }],
            ports: vec![],
        });
        store
            .apply(vec![
                Namespace::new("ns-a").into(),
                Namespace::new("monitoring").with_label("team", "obs").into(),
                Namespace::new("other").into(),
                np.into(),
            ])
            .await
            .unwrap();
        let eval = NetworkEvaluator::new(store);
        let target = pod("ns-a", "api");

        assert!(eval.is_allowed(&flow(pod("monitoring", "prom"), target.clone(), 9090, PolicyType::Ingress)).await);
        assert!(!eval.is_allowed(&flow(pod("monitoring", "grafana"), target.clone(), 9090, PolicyType::Ingress)).await);
        assert!(!eval.is_allowed(&flow(pod("other", "prom"), target, 9090, PolicyType::Ingress)).await);
    }

    #[tokio::test]
    async fn egress_is_evaluated_against_destination() {
        let store = PolicyStore::new();
        let mut np = NetworkPolicy::new("ns-a", "api-egress", LabelSelector::labels([("app", "api")]));
        np.policy_types = vec![PolicyType::Egress];
        np.egress.push(EgressRule {
            to: vec![NetworkPolicyPeer::pods(LabelSelector::labels([("app", "db")]))],
            ports: vec![NetworkPolicyPort::tcp(5432)],
        });
        store
            .apply(vec![Namespace::new("ns-a").into(), np.into()])
            .await
            .unwrap();
        let eval = NetworkEvaluator::new(store);
        let api = pod("ns-a", "api");

        assert!(eval.is_allowed(&flow(api.clone(), pod("ns-a", "db"), 5432, PolicyType::Egress)).await);
        assert!(!eval.is_allowed(&flow(api.clone(), pod("ns-a", "cache"), 6379, PolicyType::Egress)).await);
        // Egress-only policy leaves api's ingress open.
        assert!(eval.is_allowed(&flow(pod("ns-a", "web"), api, 8080, PolicyType::Ingress)).await);
    }

    #[tokio::test]
    async fn canceled_check_denies() {
        let eval = NetworkEvaluator::new(PolicyStore::new());
        let token = CancellationToken::new();
        token.cancel();
        let ctx = EvalContext::background().with_cancel(token);
        let d = eval
            .check(&flow(pod("a", "x"), pod("b", "y"), 80, PolicyType::Ingress), &ctx)
            .await;
        assert!(!d.is_allowed());
        assert_eq!(d.reason, ReasonCode::Canceled);
    }

    fn workload_strategy() -> impl Strategy<Value = Workload> {
        (
            "[a-z]{1,6}",
            proptest::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{1,6}", 0..4),
        )
            .prop_map(|(ns, labels)| Workload::new(ns, labels))
    }

    proptest! {
        /// With no policies at all every flow is allowed.
        #[test]
        fn default_open(
            src in workload_strategy(),
            dst in workload_strategy(),
            port in any::<u16>(),
            egress in any::<bool>(),
        ) {
            let state = StoreState::default();
            let direction = if egress { PolicyType::Egress } else { PolicyType::Ingress };
            let d = evaluate_flow(&state, &flow(src, dst, port, direction));
            prop_assert!(d.is_allowed());
            prop_assert_eq!(d.reason, ReasonCode::NoSelectingPolicy);
        }

        /// Once a deny-all ingress policy selects the destination, nothing gets in.
        #[test]
        fn default_deny_once_selected(
            src in workload_strategy(),
            labels in proptest::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{1,6}", 0..4),
            port in any::<u16>(),
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let d = rt.block_on(async {
                let store = PolicyStore::new();
                store
                    .apply(vec![
                        Namespace::new("locked").into(),
                        NetworkPolicy::new("locked", "deny-all", LabelSelector::everything()).into(),
                    ])
                    .await
                    .unwrap();
                let state = store.read().await;
                evaluate_flow(&state, &flow(src, Workload::new("locked", labels), port, PolicyType::Ingress))
            });
            prop_assert!(!d.is_allowed());
            prop_assert_eq!(d.reason, ReasonCode::NoMatchingNetworkRule);
        }
    }
}
