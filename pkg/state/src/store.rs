use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info};

use pkg_constants::state::EVENT_LOG_CAPACITY;
use pkg_types::clock::{SharedClock, system_clock};
use pkg_types::namespace::Namespace;
use pkg_types::network_policy::CompiledNetworkPolicy;
use pkg_types::rbac::{Role, RoleBinding};
use pkg_types::validate::validate_object;
use pkg_types::{ObjectKey, ObjectKind, PolicyError, PolicyObject, Result};

use crate::snapshot::Snapshot;
use crate::watch::{EventLog, EventType, WatchEvent};

/// Versioned in-memory policy store.
///
/// Readers share a `tokio` read lock and always see a fully committed state.
/// Every write (single put, bulk apply, delete, cascading namespace delete)
/// stages its changes on a copy, validates field rules and referential
/// integrity on the staged copy, and only then swaps it in. A rejected write
/// leaves the store untouched.
#[derive(Clone)]
pub struct PolicyStore {
    inner: Arc<RwLock<StoreState>>,
    clock: SharedClock,
    pub event_log: EventLog,
}

/// Committed store contents. Obtained through [`PolicyStore::read`].
#[derive(Debug, Clone, Default)]
pub struct StoreState {
    revision: u64,
    objects: BTreeMap<ObjectKey, PolicyObject>,
    compiled: BTreeMap<ObjectKey, Arc<CompiledNetworkPolicy>>,
}

enum WriteOp {
    Put(PolicyObject),
    Delete(ObjectKey),
}

impl StoreState {
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&PolicyObject> {
        self.objects.get(key)
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.objects.contains_key(key)
    }

    pub fn namespace(&self, name: &str) -> Option<&Namespace> {
        self.objects
            .get(&ObjectKey::namespace(name))
            .and_then(PolicyObject::as_namespace)
    }

    pub fn role(&self, key: &ObjectKey) -> Option<&Role> {
        self.objects.get(key).and_then(PolicyObject::as_role)
    }

    /// Objects of `kind`, optionally restricted to one namespace
    /// (`Some(ns)`). Namespaces themselves are cluster-scoped.
    pub fn iter_kind<'a>(
        &'a self,
        kind: ObjectKind,
        namespace: Option<&'a str>,
    ) -> impl Iterator<Item = &'a PolicyObject> + 'a {
        let lower = ObjectKey {
            kind,
            namespace: None,
            name: String::new(),
        };
        self.objects
            .range((Bound::Included(lower), Bound::Unbounded))
            .take_while(move |(k, _)| k.kind == kind)
            .filter(move |(k, _)| namespace.is_none_or(|ns| k.namespace.as_deref() == Some(ns)))
            .map(|(_, v)| v)
    }

    /// Bindings scoped to exactly `namespace` (`None` = cluster-wide).
    pub fn bindings_in<'a>(&'a self, namespace: Option<&'a str>) -> impl Iterator<Item = &'a RoleBinding> + 'a {
        self.iter_kind(ObjectKind::RoleBinding, namespace)
            .filter_map(PolicyObject::as_binding)
            .filter(move |b| b.namespace.as_deref() == namespace)
    }

    pub fn bindings(&self) -> impl Iterator<Item = &RoleBinding> {
        self.iter_kind(ObjectKind::RoleBinding, None)
            .filter_map(PolicyObject::as_binding)
    }

    pub fn roles(&self) -> impl Iterator<Item = &Role> {
        self.iter_kind(ObjectKind::Role, None).filter_map(PolicyObject::as_role)
    }

    /// Compiled network policies of one namespace.
    pub fn network_policies_in<'a>(&'a self, namespace: &'a str) -> impl Iterator<Item = &'a CompiledNetworkPolicy> + 'a {
        self.compiled
            .values()
            .filter(move |p| p.namespace == namespace)
            .map(Arc::as_ref)
    }

    pub fn objects(&self) -> impl Iterator<Item = &PolicyObject> {
        self.objects.values()
    }

    fn apply_op(&mut self, op: WriteOp, now: DateTime<Utc>) -> Result<()> {
        match op {
            WriteOp::Put(mut object) => {
                validate_object(&object)?;
                let key = object.key();
                if let PolicyObject::Namespace(ns) = &mut object {
                    let existing = self.namespace(&ns.name).and_then(|n| n.created_at);
                    ns.created_at = existing.or(ns.created_at).or(Some(now));
                }
                if let PolicyObject::NetworkPolicy(np) = &object {
                    self.compiled.insert(key.clone(), Arc::new(np.compile()?));
                }
                self.objects.insert(key, object);
            }
            WriteOp::Delete(key) => {
                if self.objects.remove(&key).is_none() {
                    return Ok(());
                }
                self.compiled.remove(&key);
                if key.kind == ObjectKind::Namespace {
                    let scoped: Vec<ObjectKey> = self
                        .objects
                        .keys()
                        .filter(|k| k.namespace.as_deref() == Some(key.name.as_str()))
                        .cloned()
                        .collect();
                    for k in scoped {
                        self.objects.remove(&k);
                        self.compiled.remove(&k);
                    }
                }
            }
        }
        Ok(())
    }

    /// Every namespaced object needs its namespace; every binding needs its
    /// role.
    fn check_integrity(&self) -> Result<()> {
        for (key, object) in &self.objects {
            if key.kind != ObjectKind::Namespace {
                if let Some(ns) = &key.namespace {
                    let ns_key = ObjectKey::namespace(ns);
                    if !self.objects.contains_key(&ns_key) {
                        return Err(PolicyError::DanglingReference {
                            object: key.clone(),
                            field: "namespace".to_string(),
                            target: ns_key,
                        });
                    }
                }
            }
            if let PolicyObject::RoleBinding(binding) = object {
                let role_key = binding.role_key();
                if !self.objects.contains_key(&role_key) {
                    return Err(PolicyError::DanglingReference {
                        object: key.clone(),
                        field: "roleRef".to_string(),
                        target: role_key,
                    });
                }
            }
        }
        Ok(())
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreState::default())),
            clock,
            event_log: EventLog::new(EVENT_LOG_CAPACITY),
        }
    }

    /// Consistent read view. Hold it only for the duration of one evaluation.
    pub async fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.inner.read().await
    }

    pub async fn revision(&self) -> u64 {
        self.inner.read().await.revision
    }

    /// Create or replace one object.
    pub async fn put(&self, object: impl Into<PolicyObject>) -> Result<u64> {
        let (revision, _) = self.commit(vec![WriteOp::Put(object.into())]).await?;
        Ok(revision)
    }

    /// Create or replace many objects as one all-or-nothing write.
    pub async fn apply(&self, objects: Vec<PolicyObject>) -> Result<u64> {
        let count = objects.len();
        let (revision, _) = self
            .commit(objects.into_iter().map(WriteOp::Put).collect())
            .await?;
        info!(revision, objects = count, "Applied policy objects");
        Ok(revision)
    }

    /// Delete an object if it is present. Deleting a Namespace removes
    /// everything scoped to it in the same commit. Returns the removed object.
    ///
    /// Two racing deletes of the same key both succeed; only the one that
    /// actually removed the object gets it back.
    pub async fn delete(&self, key: &ObjectKey) -> Result<Option<PolicyObject>> {
        let (_, events) = self.commit(vec![WriteOp::Delete(key.clone())]).await?;
        Ok(events
            .into_iter()
            .find(|e| e.event_type == EventType::Delete && &e.key == key)
            .and_then(|e| e.object))
    }

    pub async fn get(&self, key: &ObjectKey) -> Option<PolicyObject> {
        self.inner.read().await.objects.get(key).cloned()
    }

    /// Objects of `kind`; `namespace = Some(ns)` restricts to one namespace.
    pub async fn list(&self, kind: ObjectKind, namespace: Option<&str>) -> Vec<PolicyObject> {
        self.inner
            .read()
            .await
            .iter_kind(kind, namespace)
            .cloned()
            .collect()
    }

    /// Every object scoped to namespace `ns` (the Namespace itself excluded).
    pub async fn list_namespace(&self, ns: &str) -> Vec<PolicyObject> {
        self.inner
            .read()
            .await
            .objects
            .iter()
            .filter(|(k, _)| k.kind != ObjectKind::Namespace && k.namespace.as_deref() == Some(ns))
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub async fn snapshot(&self) -> Snapshot {
        let state = self.inner.read().await;
        Snapshot::new(
            state.revision,
            self.clock.now(),
            state.objects.values().cloned().collect(),
        )
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> Result<(u64, Vec<WatchEvent>)> {
        let now = self.clock.now();
        let mut state = self.inner.write().await;

        let mut staged = state.clone();
        for op in ops {
            staged.apply_op(op, now)?;
        }
        staged.check_integrity()?;

        let revision = state.revision + 1;
        let mut events = Vec::new();
        for (key, object) in &staged.objects {
            if state.objects.get(key) != Some(object) {
                events.push(WatchEvent {
                    revision,
                    event_type: EventType::Put,
                    key: key.clone(),
                    object: Some(object.clone()),
                });
            }
        }
        for (key, object) in &state.objects {
            if !staged.objects.contains_key(key) {
                events.push(WatchEvent {
                    revision,
                    event_type: EventType::Delete,
                    key: key.clone(),
                    object: Some(object.clone()),
                });
            }
        }
        if events.is_empty() {
            return Ok((state.revision, events));
        }

        staged.revision = revision;
        *state = staged;
        debug!(revision, changes = events.len(), "Committed policy change");

        for event in &events {
            self.event_log.emit(event.clone()).await;
        }
        Ok((revision, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::network_policy::{IngressRule, NetworkPolicy, NetworkPolicyPeer, PolicyType};
    use pkg_types::rbac::{PolicyRule, RoleRef, Subject};
    use pkg_types::selector::LabelSelector;

    fn reader(ns: &str) -> Role {
        Role::namespaced(ns, "reader", vec![PolicyRule::new(["pods"], ["get", "list"])])
    }

    fn binding(ns: &str, name: &str) -> RoleBinding {
        RoleBinding::namespaced(ns, name, RoleRef::role("reader"), vec![Subject::user("alice")])
    }

    async fn seeded() -> PolicyStore {
        let store = PolicyStore::new();
        store
            .apply(vec![
                Namespace::new("ns-a").into(),
                reader("ns-a").into(),
                binding("ns-a", "alice-reader").into(),
                NetworkPolicy::new("ns-a", "deny-all", LabelSelector::everything()).into(),
            ])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn binding_without_role_is_rejected() {
        let store = PolicyStore::new();
        store.put(Namespace::new("ns-a")).await.unwrap();
        let err = store.put(binding("ns-a", "b")).await.unwrap_err();
        assert_eq!(err.code(), "ErrDanglingReference");
        match err {
            PolicyError::DanglingReference { field, target, .. } => {
                assert_eq!(field, "roleRef");
                assert_eq!(target, ObjectKey::namespaced(ObjectKind::Role, "ns-a", "reader"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.list(ObjectKind::RoleBinding, None).await.is_empty());
    }

    #[tokio::test]
    async fn objects_need_their_namespace() {
        let store = PolicyStore::new();
        let err = store.put(reader("ghost")).await.unwrap_err();
        assert!(matches!(err, PolicyError::DanglingReference { ref field, .. } if field == "namespace"));
        let err = store
            .put(NetworkPolicy::new("ghost", "p", LabelSelector::everything()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ErrDanglingReference");
    }

    #[tokio::test]
    async fn apply_is_all_or_nothing() {
        let store = PolicyStore::new();
        let err = store
            .apply(vec![
                Namespace::new("ns-a").into(),
                reader("ns-a").into(),
                binding("ns-b", "orphan").into(),
            ])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ErrDanglingReference");
        assert_eq!(store.revision().await, 0);
        assert!(store.get(&ObjectKey::namespace("ns-a")).await.is_none());
    }

    #[tokio::test]
    async fn apply_order_does_not_matter() {
        let store = PolicyStore::new();
        store
            .apply(vec![
                binding("ns-a", "alice-reader").into(),
                reader("ns-a").into(),
                Namespace::new("ns-a").into(),
            ])
            .await
            .unwrap();
        assert_eq!(store.list(ObjectKind::RoleBinding, Some("ns-a")).await.len(), 1);
    }

    #[tokio::test]
    async fn malformed_selector_is_rejected() {
        let store = PolicyStore::new();
        store.put(Namespace::new("ns-a")).await.unwrap();
        let mut np = NetworkPolicy::new("ns-a", "bad", LabelSelector::everything());
        np.ingress.push(IngressRule {
            from: vec![NetworkPolicyPeer::pods(LabelSelector::labels([("-bad", "x")]))],
            ports: vec![],
        });
        let err = store.put(np).await.unwrap_err();
        assert_eq!(err.code(), "ErrMalformedSelector");
        assert!(store.read().await.network_policies_in("ns-a").next().is_none());
    }

    #[tokio::test]
    async fn malformed_selector_in_undeclared_direction_is_rejected() {
        let store = PolicyStore::new();
        store.put(Namespace::new("ns-a")).await.unwrap();
        let mut np = NetworkPolicy::new("ns-a", "egress-only", LabelSelector::everything());
        np.policy_types = vec![PolicyType::Egress];
        np.ingress.push(IngressRule {
            from: vec![NetworkPolicyPeer::pods(LabelSelector::labels([("-bad key!", "x")]))],
            ports: vec![],
        });
        let err = store.put(np).await.unwrap_err();
        assert_eq!(err.code(), "ErrMalformedSelector");
        assert_eq!(store.revision().await, 1);
    }

    #[tokio::test]
    async fn namespace_delete_cascades() {
        let store = seeded().await;
        store.put(Namespace::new("ns-b")).await.unwrap();
        store.put(reader("ns-b")).await.unwrap();

        let removed = store.delete(&ObjectKey::namespace("ns-a")).await.unwrap();
        assert!(removed.is_some());
        assert!(store.list_namespace("ns-a").await.is_empty());
        for kind in [ObjectKind::Role, ObjectKind::RoleBinding, ObjectKind::NetworkPolicy] {
            assert!(store.list(kind, Some("ns-a")).await.is_empty());
        }
        assert!(store.read().await.network_policies_in("ns-a").next().is_none());
        assert_eq!(store.list_namespace("ns-b").await.len(), 1);
    }

    #[tokio::test]
    async fn cascade_is_one_revision_with_events() {
        let store = seeded().await;
        let before = store.revision().await;
        let mut rx = store.event_log.subscribe();
        store.delete(&ObjectKey::namespace("ns-a")).await.unwrap();
        assert_eq!(store.revision().await, before + 1);

        let mut deleted = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            assert_eq!(ev.revision, before + 1);
            assert_eq!(ev.event_type, EventType::Delete);
            deleted.push(ev.key.kind);
        }
        assert_eq!(deleted.len(), 4);
    }

    #[tokio::test]
    async fn delete_missing_is_noop() {
        let store = seeded().await;
        let rev = store.revision().await;
        let key = ObjectKey::namespaced(ObjectKind::RoleBinding, "ns-a", "nobody");
        assert!(store.delete(&key).await.unwrap().is_none());
        assert!(store.delete(&key).await.unwrap().is_none());
        assert_eq!(store.revision().await, rev);
    }

    #[tokio::test]
    async fn referenced_role_cannot_be_deleted() {
        let store = seeded().await;
        let role_key = ObjectKey::namespaced(ObjectKind::Role, "ns-a", "reader");
        let err = store.delete(&role_key).await.unwrap_err();
        assert_eq!(err.code(), "ErrDanglingReference");
        assert!(store.get(&role_key).await.is_some());

        store
            .delete(&ObjectKey::namespaced(ObjectKind::RoleBinding, "ns-a", "alice-reader"))
            .await
            .unwrap();
        assert!(store.delete(&role_key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn identical_put_does_not_bump_revision() {
        let store = seeded().await;
        let rev = store.revision().await;
        store.put(reader("ns-a")).await.unwrap();
        store.put(Namespace::new("ns-a")).await.unwrap();
        assert_eq!(store.revision().await, rev);
    }

    #[tokio::test]
    async fn namespace_creation_time_is_preserved() {
        let store = seeded().await;
        let first = store.read().await.namespace("ns-a").unwrap().created_at;
        assert!(first.is_some());
        store
            .put(Namespace::new("ns-a").with_label("team", "core"))
            .await
            .unwrap();
        let state = store.read().await;
        let ns = state.namespace("ns-a").unwrap();
        assert_eq!(ns.created_at, first);
        assert_eq!(ns.labels["team"], "core");
    }

    #[tokio::test]
    async fn list_filters_by_namespace() {
        let store = seeded().await;
        store.put(Namespace::new("ns-b")).await.unwrap();
        store.put(reader("ns-b")).await.unwrap();
        store
            .put(Role::cluster("view", vec![PolicyRule::new(["pods"], ["get"])]))
            .await
            .unwrap();
        assert_eq!(store.list(ObjectKind::Role, None).await.len(), 3);
        assert_eq!(store.list(ObjectKind::Role, Some("ns-b")).await.len(), 1);
        assert_eq!(store.list(ObjectKind::Namespace, None).await.len(), 2);
        assert_eq!(store.read().await.bindings_in(None).count(), 0);
        assert_eq!(store.read().await.bindings_in(Some("ns-a")).count(), 1);
    }
}
