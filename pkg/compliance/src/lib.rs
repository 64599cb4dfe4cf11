//! Drift detection against a trusted baseline, misconfiguration checks and
//! compliance reports.

pub mod detector;
pub mod diff;
pub mod report;
pub mod violations;

pub use detector::{DriftDetector, GrantLedger};
pub use report::{ComplianceReporter, Report, ReportPeriod};
pub use violations::ViolationLog;
