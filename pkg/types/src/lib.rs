//! Shared data model for kgate: policy objects, selectors, grants,
//! violations, decisions and the error taxonomy.

pub mod clock;
pub mod config;
pub mod decision;
pub mod error;
pub mod grant;
pub mod namespace;
pub mod network_policy;
pub mod object;
pub mod rbac;
pub mod request;
pub mod selector;
pub mod validate;
pub mod violation;

pub use error::{PolicyError, Result};
pub use object::{ObjectKey, ObjectKind, PolicyObject};
