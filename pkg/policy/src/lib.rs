//! Read-only evaluators over the policy store: RBAC authorization and
//! network isolation, plus the pure matching functions they share.

pub mod audit;
pub mod authorizer;
pub mod context;
pub mod identity;
pub mod matcher;
pub mod network;

pub use audit::AccessLog;
pub use authorizer::Authorizer;
pub use context::EvalContext;
pub use identity::{IdentityProvider, IdentityResolver, StaticIdentityProvider};
pub use network::NetworkEvaluator;
