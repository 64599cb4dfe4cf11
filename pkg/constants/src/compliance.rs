//! Drift detection and reporting constants.

/// Default period of the background drift scan, in seconds.
pub const DEFAULT_DRIFT_INTERVAL_SECS: u64 = 300;

/// An active grant unused for this long is reported as orphaned (1h).
pub const DEFAULT_ORPHAN_STALENESS_SECS: u64 = 60 * 60;

/// Violations retained by the in-memory violation log.
pub const VIOLATION_LOG_CAPACITY: usize = 4096;
