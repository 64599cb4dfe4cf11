use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;

use pkg_types::clock::SharedClock;
use pkg_types::grant::AccessGrant;
use pkg_types::violation::{Severity, Violation};

use crate::detector::{DriftDetector, GrantLedger};
use crate::violations::ViolationLog;

/// A period that ended less than this long ago still counts as current.
const CURRENT_PERIOD_SLACK_SECS: i64 = 60;

/// Inclusive time window a report covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportPeriod {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl ReportPeriod {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// The `length` leading up to `now`.
    pub fn last(length: chrono::Duration, now: DateTime<Utc>) -> Self {
        Self {
            from: now - length,
            to: now,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.from && at <= self.to
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineInfo {
    pub revision: u64,
    pub hash: String,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceGroup {
    /// `None` for cluster-scoped objects.
    pub namespace: Option<String>,
    pub violations: Vec<Violation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeveritySection {
    pub severity: Severity,
    pub namespaces: Vec<NamespaceGroup>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub generated_at: DateTime<Utc>,
    pub period: ReportPeriod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<BaselineInfo>,
    pub total_violations: usize,
    pub counts: BTreeMap<Severity, usize>,
    /// Highest severity first; namespaces in name order, cluster scope first.
    pub sections: Vec<SeveritySection>,
    /// Grants with audit events in the period; each history is trimmed to it.
    pub grants: Vec<AccessGrant>,
}

impl Report {
    /// Deduplicate by (kind, object), keeping the most recent finding, and
    /// group by severity then namespace.
    pub fn build(
        generated_at: DateTime<Utc>,
        period: ReportPeriod,
        baseline: Option<BaselineInfo>,
        violations: Vec<Violation>,
        mut grants: Vec<AccessGrant>,
    ) -> Self {
        let mut latest: HashMap<_, Violation> = HashMap::new();
        for v in violations {
            match latest.get(&v.dedup_key()) {
                Some(seen) if seen.detected_at >= v.detected_at => {}
                _ => {
                    latest.insert(v.dedup_key(), v);
                }
            }
        }

        let mut grouped: BTreeMap<Severity, BTreeMap<Option<String>, Vec<Violation>>> = BTreeMap::new();
        for v in latest.into_values() {
            grouped
                .entry(v.severity)
                .or_default()
                .entry(v.namespace.clone())
                .or_default()
                .push(v);
        }

        let mut counts = BTreeMap::new();
        let mut total = 0;
        let mut sections = Vec::new();
        for (severity, by_ns) in grouped.into_iter().rev() {
            let mut namespaces = Vec::new();
            for (namespace, mut violations) in by_ns {
                violations.sort_by(|a, b| (&a.object, a.kind).cmp(&(&b.object, b.kind)));
                *counts.entry(severity).or_insert(0) += violations.len();
                total += violations.len();
                namespaces.push(NamespaceGroup {
                    namespace,
                    violations,
                });
            }
            sections.push(SeveritySection {
                severity,
                namespaces,
            });
        }

        for grant in &mut grants {
            grant.history.retain(|e| period.contains(e.at));
        }
        grants.sort_by(|a, b| (a.requested_at, &a.id).cmp(&(b.requested_at, &b.id)));

        Self {
            generated_at,
            period,
            baseline,
            total_violations: total,
            counts,
            sections,
            grants,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "kgate compliance report");
        let _ = writeln!(
            out,
            "period:    {} .. {}",
            self.period.from.to_rfc3339(),
            self.period.to.to_rfc3339()
        );
        let _ = writeln!(out, "generated: {}", self.generated_at.to_rfc3339());
        match &self.baseline {
            Some(b) => {
                let _ = writeln!(
                    out,
                    "baseline:  revision {} taken {} ({})",
                    b.revision,
                    b.taken_at.to_rfc3339(),
                    b.hash
                );
            }
            None => {
                let _ = writeln!(out, "baseline:  none");
            }
        }
        let counts: Vec<String> = self
            .counts
            .iter()
            .rev()
            .map(|(s, n)| format!("{}={}", s, n))
            .collect();
        let _ = writeln!(
            out,
            "violations: {} ({})",
            self.total_violations,
            if counts.is_empty() { "none".to_string() } else { counts.join(", ") }
        );

        for section in &self.sections {
            let _ = writeln!(out, "\n[{}]", section.severity);
            for group in &section.namespaces {
                let _ = writeln!(
                    out,
                    "  {}",
                    match &group.namespace {
                        Some(ns) => format!("namespace {}", ns),
                        None => "cluster-scoped".to_string(),
                    }
                );
                for v in &group.violations {
                    let _ = writeln!(out, "    {} {}: {}", v.kind, v.object, v.message);
                }
            }
        }

        let _ = writeln!(out, "\nJIT access grants: {}", self.grants.len());
        for grant in &self.grants {
            let _ = writeln!(
                out,
                "  {} {} -> {:?} {} in {} [{}]",
                grant.id, grant.principal, grant.role_ref.kind, grant.role_ref.name, grant.namespace, grant.state
            );
            for event in &grant.history {
                let _ = writeln!(
                    out,
                    "    {} {} by {}{}",
                    event.at.to_rfc3339(),
                    event.state,
                    event.actor,
                    event.note.as_deref().map(|n| format!(" ({})", n)).unwrap_or_default()
                );
            }
        }
        out
    }
}

/// Builds compliance reports from a fresh scan, the recorded violation
/// history and the JIT audit trail.
#[derive(Clone)]
pub struct ComplianceReporter {
    detector: DriftDetector,
    history: ViolationLog,
    grants: Option<Arc<dyn GrantLedger>>,
    clock: SharedClock,
}

impl ComplianceReporter {
    pub fn new(detector: DriftDetector, history: ViolationLog, clock: SharedClock) -> Self {
        let grants = detector.grants().cloned();
        Self {
            detector,
            history,
            grants,
            clock,
        }
    }

    /// A fresh scan is included only when the period reaches the present.
    pub async fn generate(&self, period: ReportPeriod) -> Report {
        let now = self.clock.now();
        let current = period.from <= now
            && now - period.to <= chrono::Duration::seconds(CURRENT_PERIOD_SLACK_SECS);
        let mut violations: Vec<Violation> = if current {
            self.detector.scan().await
        } else {
            Vec::new()
        };
        violations.extend(self.history.between(period.from, period.to).await);

        let grants = match &self.grants {
            Some(ledger) => ledger.grants_touched_between(period.from, period.to).await,
            None => Vec::new(),
        };
        let baseline = self.detector.baseline().await.map(|b| BaselineInfo {
            revision: b.revision,
            hash: b.hash,
            taken_at: b.taken_at,
        });
        Report::build(now, period, baseline, violations, grants)
    }
}
