//! Just-in-time access constants.

/// Upper bound on the expiry sweeper period, in seconds.
pub const MAX_SWEEP_INTERVAL_SECS: u64 = 60;

/// Default expiry sweeper period, in seconds.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 15;

/// Longest grant a principal may request unless configured otherwise (8h).
pub const DEFAULT_MAX_GRANT_DURATION_SECS: u64 = 8 * 60 * 60;

/// Expired and revoked grants are kept this long after their last
/// transition so reports can still cite them (7 days).
pub const DEFAULT_GRANT_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;

/// Prefix of RoleBinding names created for grants: `jit-<grant id>`.
pub const GRANT_BINDING_PREFIX: &str = "jit-";

/// Actor recorded on transitions performed by the sweeper.
pub const SWEEPER_ACTOR: &str = "system:jit-sweeper";

/// Default upper bound on an external identity lookup, in milliseconds.
pub const DEFAULT_IDENTITY_TIMEOUT_MS: u64 = 500;
