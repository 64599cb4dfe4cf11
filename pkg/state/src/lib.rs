//! Policy store: the single owner of Namespaces, Roles, RoleBindings and
//! NetworkPolicies, with a watch log and optional SlateDB persistence.

pub mod client;
pub mod persist;
pub mod snapshot;
pub mod store;
pub mod watch;

pub use snapshot::Snapshot;
pub use store::{PolicyStore, StoreState};
