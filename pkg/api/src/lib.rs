//! HTTP API of kgate: policy administration, queries, JIT grants and
//! compliance reporting, protected by the engine's own RBAC.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod request_id;
pub mod server;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use pkg_compliance::{ComplianceReporter, DriftDetector, ViolationLog};
use pkg_controllers::JitController;
use pkg_metrics::SharedMetrics;
use pkg_policy::{Authorizer, EvalContext, NetworkEvaluator};
use pkg_state::PolicyStore;
use pkg_types::clock::SharedClock;

use crate::auth::AuthUser;

/// Shared application state injected into all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: PolicyStore,
    pub authorizer: Authorizer,
    pub network: NetworkEvaluator,
    pub jit: JitController,
    pub detector: DriftDetector,
    pub reporter: ComplianceReporter,
    pub violations: ViolationLog,
    pub metrics: SharedMetrics,
    pub clock: SharedClock,
    /// Bearer token to the identity it authenticates.
    pub tokens: Arc<BTreeMap<String, AuthUser>>,
    pub eval_timeout: Duration,
}

impl AppState {
    /// Evaluation context for one API request.
    pub fn eval_context(&self) -> EvalContext {
        EvalContext::with_timeout(self.eval_timeout)
    }
}
