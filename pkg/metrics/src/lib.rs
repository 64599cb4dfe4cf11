use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub const AUTHZ_DECISIONS: &str = "kgate_authorization_decisions_total";
pub const NETWORK_DECISIONS: &str = "kgate_network_decisions_total";
pub const POLICY_WRITES: &str = "kgate_policy_writes_total";
pub const POLICY_OBJECTS: &str = "kgate_policy_objects";
pub const ACTIVE_GRANTS: &str = "kgate_active_grants";
pub const GRANT_TRANSITIONS: &str = "kgate_grant_transitions_total";
pub const SWEEPS: &str = "kgate_sweeps_total";
pub const DRIFT_SCANS: &str = "kgate_drift_scans_total";
pub const OPEN_VIOLATIONS: &str = "kgate_open_violations";

/// A lightweight, thread-safe metrics registry that renders in Prometheus text exposition format.
///
/// Series are keyed by metric name plus an optional label set, so
/// `kgate_authorization_decisions_total{verdict="Deny"}` and
/// `{verdict="Allow"}` are tracked separately under one HELP/TYPE header.
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, Family<AtomicU64>>>,
    gauges: RwLock<BTreeMap<String, Family<AtomicI64>>>,
}

struct Family<V> {
    help: String,
    series: BTreeMap<String, V>,
}

/// Shared handle to the registry.
pub type SharedMetrics = Arc<MetricsRegistry>;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Render `{k="v",...}` with labels in the given order.
fn label_set(labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("{{{}}}", parts.join(","))
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(BTreeMap::new()),
            gauges: RwLock::new(BTreeMap::new()),
        }
    }

    /// Registry with every kgate metric registered.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register_counter(AUTHZ_DECISIONS, "Authorization decisions by verdict and reason");
        registry.register_counter(NETWORK_DECISIONS, "Network flow decisions by verdict and reason");
        registry.register_counter(POLICY_WRITES, "Policy objects written through the API, by operation");
        registry.register_gauge(POLICY_OBJECTS, "Objects held by the policy store");
        registry.register_gauge(ACTIVE_GRANTS, "JIT access grants currently active");
        registry.register_counter(GRANT_TRANSITIONS, "JIT grant state transitions by target state");
        registry.register_counter(SWEEPS, "Expiry sweeper passes");
        registry.register_counter(DRIFT_SCANS, "Drift detector scans");
        registry.register_gauge(OPEN_VIOLATIONS, "Violations found by the last scan, by severity");
        registry
    }

    /// Register a counter. If it already exists, this is a no-op.
    pub fn register_counter(&self, name: &str, help: &str) {
        write(&self.counters)
            .entry(name.to_string())
            .or_insert_with(|| Family {
                help: help.to_string(),
                series: BTreeMap::new(),
            });
    }

    /// Register a gauge. If it already exists, this is a no-op.
    pub fn register_gauge(&self, name: &str, help: &str) {
        write(&self.gauges)
            .entry(name.to_string())
            .or_insert_with(|| Family {
                help: help.to_string(),
                series: BTreeMap::new(),
            });
    }

    /// Increment a counter by 1.
    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)]) {
        self.counter_add(name, labels, 1);
    }

    /// Increment a counter by a given amount. Unregistered names are ignored.
    pub fn counter_add(&self, name: &str, labels: &[(&str, &str)], val: u64) {
        let key = label_set(labels);
        {
            let counters = read(&self.counters);
            match counters.get(name) {
                Some(family) => {
                    if let Some(c) = family.series.get(&key) {
                        c.fetch_add(val, Ordering::Relaxed);
                        return;
                    }
                }
                None => return,
            }
        }
        let mut counters = write(&self.counters);
        if let Some(family) = counters.get_mut(name) {
            family
                .series
                .entry(key)
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(val, Ordering::Relaxed);
        }
    }

    /// Set a gauge to a specific value. Unregistered names are ignored.
    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], val: i64) {
        let key = label_set(labels);
        let mut gauges = write(&self.gauges);
        if let Some(family) = gauges.get_mut(name) {
            family
                .series
                .entry(key)
                .or_insert_with(|| AtomicI64::new(0))
                .store(val, Ordering::Relaxed);
        }
    }

    /// Current value of a counter series, if it has been touched.
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<u64> {
        read(&self.counters)
            .get(name)
            .and_then(|f| f.series.get(&label_set(labels)))
            .map(|c| c.load(Ordering::Relaxed))
    }

    /// Current value of a gauge series, if it has been set.
    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<i64> {
        read(&self.gauges)
            .get(name)
            .and_then(|f| f.series.get(&label_set(labels)))
            .map(|g| g.load(Ordering::Relaxed))
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut output = String::new();

        let counters = read(&self.counters);
        for (name, family) in counters.iter() {
            output.push_str(&format!("# HELP {} {}\n", name, family.help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            for (labels, value) in &family.series {
                output.push_str(&format!(
                    "{}{} {}\n",
                    name,
                    labels,
                    value.load(Ordering::Relaxed)
                ));
            }
        }

        let gauges = read(&self.gauges);
        for (name, family) in gauges.iter() {
            output.push_str(&format!("# HELP {} {}\n", name, family.help));
            output.push_str(&format!("# TYPE {} gauge\n", name));
            for (labels, value) in &family.series {
                output.push_str(&format!(
                    "{}{} {}\n",
                    name,
                    labels,
                    value.load(Ordering::Relaxed)
                ));
            }
        }

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
