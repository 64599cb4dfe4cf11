use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pkg_constants::jit::MAX_SWEEP_INTERVAL_SECS;
use pkg_metrics::{SWEEPS, SharedMetrics};

use crate::jit::JitController;

/// Background controller that expires JIT grants and stale bindings.
/// The period is clamped to at most one minute.
pub struct ExpirySweeper {
    jit: JitController,
    interval: Duration,
    metrics: Option<SharedMetrics>,
}

impl ExpirySweeper {
    pub fn new(jit: JitController, interval: Duration) -> Self {
        let interval = interval
            .min(Duration::from_secs(MAX_SWEEP_INTERVAL_SECS))
            .max(Duration::from_secs(1));
        Self {
            jit,
            interval,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start the sweep loop as a background task; it exits when `shutdown`
    /// is canceled.
    pub fn start(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "ExpirySweeper started (interval={}s)",
                self.interval.as_secs()
            );
            let mut interval = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.reconcile().await {
                            warn!("ExpirySweeper reconcile error: {}", e);
                        }
                    }
                }
            }
            info!("ExpirySweeper stopped");
        })
    }

    async fn reconcile(&self) -> anyhow::Result<()> {
        let stats = self.jit.sweep().await?;
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc(SWEEPS, &[]);
        }
        if stats.expired + stats.revoked + stats.bindings_deleted + stats.pruned > 0 {
            info!(
                "Sweep: {} expired, {} revoked, {} bindings deleted, {} grants pruned",
                stats.expired, stats.revoked, stats.bindings_deleted, stats.pruned
            );
        }
        Ok(())
    }
}
