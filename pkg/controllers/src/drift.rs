use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pkg_compliance::{DriftDetector, ViolationLog};
use pkg_metrics::{DRIFT_SCANS, OPEN_VIOLATIONS, SharedMetrics};
use pkg_types::violation::Severity;

/// Background controller that periodically scans for drift and
/// misconfigurations and records the findings in the violation log.
pub struct DriftController {
    detector: DriftDetector,
    log: ViolationLog,
    interval: Duration,
    metrics: Option<SharedMetrics>,
}

impl DriftController {
    pub fn new(detector: DriftDetector, log: ViolationLog, interval: Duration) -> Self {
        Self {
            detector,
            log,
            interval: interval.max(Duration::from_secs(1)),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn start(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "DriftController started (interval={}s)",
                self.interval.as_secs()
            );
            let mut interval = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.reconcile().await {
                            warn!("DriftController reconcile error: {}", e);
                        }
                    }
                }
            }
            info!("DriftController stopped");
        })
    }

    /// One scan pass.
    async fn reconcile(&self) -> anyhow::Result<()> {
        let violations = self.detector.scan().await;

        let mut by_severity: BTreeMap<Severity, usize> = BTreeMap::new();
        for v in &violations {
            *by_severity.entry(v.severity).or_insert(0) += 1;
        }
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc(DRIFT_SCANS, &[]);
            for severity in [Severity::Low, Severity::Medium, Severity::High, Severity::Critical] {
                let label = severity.to_string();
                let count = by_severity.get(&severity).copied().unwrap_or(0);
                metrics.gauge_set(OPEN_VIOLATIONS, &[("severity", &label)], count as i64);
            }
        }

        if violations.is_empty() {
            info!("Drift scan clean");
        } else {
            let summary: Vec<String> = by_severity
                .iter()
                .rev()
                .map(|(s, n)| format!("{}={}", s, n))
                .collect();
            warn!(
                "Drift scan found {} violations ({})",
                violations.len(),
                summary.join(", ")
            );
        }
        self.log.record(violations).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_policy::AccessLog;
    use pkg_state::PolicyStore;
    use pkg_types::clock::system_clock;
    use pkg_types::namespace::Namespace;
    use pkg_types::rbac::{PolicyRule, Role};

    #[tokio::test]
    async fn scans_into_the_violation_log() {
        let store = PolicyStore::new();
        store
            .apply(vec![
                Namespace::new("ns-a").into(),
                Role::namespaced("ns-a", "star", vec![PolicyRule::new(["*"], ["get"])]).into(),
            ])
            .await
            .unwrap();
        let detector = DriftDetector::new(store, system_clock(), AccessLog::new());
        let log = ViolationLog::default();
        let metrics = std::sync::Arc::new(pkg_metrics::MetricsRegistry::with_defaults());

        let shutdown = CancellationToken::new();
        let handle = DriftController::new(detector, log.clone(), Duration::from_secs(300))
            .with_metrics(metrics.clone())
            .start(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(log.len().await, 1);
        assert_eq!(metrics.counter_value(DRIFT_SCANS, &[]), Some(1));
        assert_eq!(metrics.gauge_value(OPEN_VIOLATIONS, &[("severity", "High")]), Some(1));
        assert_eq!(metrics.gauge_value(OPEN_VIOLATIONS, &[("severity", "Critical")]), Some(0));
    }
}
