//! Bootstrap identities used to protect the kgate API with its own engine.

/// User name the admin bearer token authenticates as.
pub const ADMIN_USER: &str = "admin";

/// Group every operator principal belongs to.
pub const OPERATORS_GROUP: &str = "kgate:operators";

/// ClusterRole seeded at startup that grants full access to the kgate API.
pub const ADMIN_CLUSTER_ROLE: &str = "kgate-admin";

/// Cluster-wide binding of [`OPERATORS_GROUP`] to [`ADMIN_CLUSTER_ROLE`].
pub const ADMIN_CLUSTER_BINDING: &str = "kgate-operators";

/// API group that kgate's own endpoints are authorized under.
pub const API_GROUP: &str = "kgate.io";

/// Role name treated as cluster-admin-equivalent by the drift detector.
pub const CLUSTER_ADMIN_ROLE: &str = "cluster-admin";

/// Admin bearer token used when none is configured. Development only.
pub const DEFAULT_ADMIN_TOKEN: &str = "kgate-dev-token";

/// Upper bound on one authorization or network check made through the API.
pub const DEFAULT_EVAL_TIMEOUT_MS: u64 = 2_000;

/// Resources of the kgate API, as derived from request paths.
pub const API_RESOURCES: [&str; 10] = [
    "apply",
    "namespaces",
    "roles",
    "rolebindings",
    "networkpolicies",
    "authorize",
    "network",
    "grants",
    "compliance",
    "watch",
];

/// Verbs of the kgate API.
pub const API_VERBS: [&str; 6] = ["get", "create", "delete", "approve", "revoke", "watch"];
