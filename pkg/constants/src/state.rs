//! Policy store constants.

/// Root of every persisted key.
pub const REGISTRY_PREFIX: &str = "/registry/";

/// Namespace segment used for cluster-scoped objects in registry keys.
pub const CLUSTER_SCOPE_SEGMENT: &str = "_cluster";

/// Number of watch events kept in memory for late subscribers.
pub const EVENT_LOG_CAPACITY: usize = 1024;

/// Namespaces created on first start.
pub const DEFAULT_NAMESPACES: [&str; 2] = ["default", "kgate-system"];

/// Maximum length of an object name.
pub const MAX_NAME_LEN: usize = 63;
