use axum::{
    Router, middleware,
    routing::{get, post},
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pkg_compliance::{ComplianceReporter, DriftDetector, ViolationLog};
use pkg_constants::auth::{
    ADMIN_CLUSTER_BINDING, ADMIN_CLUSTER_ROLE, API_GROUP, API_RESOURCES, API_VERBS, OPERATORS_GROUP,
};
use pkg_constants::state::DEFAULT_NAMESPACES;
use pkg_controllers::{DriftController, ExpirySweeper, JitController};
use pkg_metrics::{MetricsRegistry, SharedMetrics};
use pkg_policy::{AccessLog, Authorizer, IdentityResolver, NetworkEvaluator, StaticIdentityProvider};
use pkg_state::PolicyStore;
use pkg_state::client::StateStore;
use pkg_state::persist::Persister;
use pkg_types::clock::{SharedClock, system_clock};
use pkg_types::config::{ApiUser, load_policy_file};
use pkg_types::namespace::Namespace;
use pkg_types::rbac::{PolicyRule, Role, RoleBinding, Subject};
use pkg_types::{ObjectKey, PolicyObject};

use crate::AppState;
use crate::auth::{AuthUser, auth_middleware, rbac_middleware};
use crate::handlers::{compliance, grants, health, policies, query, watch};
use crate::request_id::request_id_middleware;

/// Server configuration passed from the binary's CLI.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub data_dir: String,
    /// Mirror the policy store into SlateDB under `data_dir`.
    pub persist: bool,
    pub admin_token: String,
    pub policy_file: Option<String>,
    pub sweep_interval: Duration,
    pub drift_interval: Duration,
    pub orphan_staleness: Duration,
    pub identity_timeout: Duration,
    pub eval_timeout: Duration,
    pub max_grant_duration_secs: u64,
    /// Static principal to groups map; empty disables identity lookup.
    pub groups: BTreeMap<String, Vec<String>>,
    /// Additional API callers keyed by bearer token.
    pub users: BTreeMap<String, ApiUser>,
}

/// Bearer tokens accepted by the API. The admin token always authenticates
/// as the built-in operator, even if a configured user reuses it.
fn token_table(config: &ServerConfig) -> BTreeMap<String, AuthUser> {
    let mut tokens: BTreeMap<String, AuthUser> = config
        .users
        .iter()
        .map(|(token, user)| {
            (
                token.clone(),
                AuthUser {
                    name: user.name.clone(),
                    groups: user.groups.clone(),
                },
            )
        })
        .collect();
    if tokens.insert(config.admin_token.clone(), AuthUser::admin()).is_some() {
        warn!("A configured user shares the admin token; it authenticates as the admin");
    }
    tokens
}

/// Wire the evaluators, the JIT controller and the compliance components
/// around one store.
pub fn build_state(config: &ServerConfig, store: PolicyStore, clock: SharedClock) -> AppState {
    let metrics: SharedMetrics = Arc::new(MetricsRegistry::with_defaults());
    let access_log = AccessLog::new();

    let identity = if config.groups.is_empty() {
        IdentityResolver::disabled()
    } else {
        IdentityResolver::new(
            Arc::new(StaticIdentityProvider::new(config.groups.clone())),
            config.identity_timeout,
        )
    };
    let authorizer = Authorizer::new(store.clone(), clock.clone())
        .with_identity(identity)
        .with_access_log(access_log.clone())
        .with_metrics(metrics.clone());
    let network = NetworkEvaluator::new(store.clone()).with_metrics(metrics.clone());
    let jit = JitController::new(store.clone(), clock.clone())
        .with_max_duration_secs(config.max_grant_duration_secs)
        .with_metrics(metrics.clone());

    let staleness = chrono::Duration::from_std(config.orphan_staleness)
        .unwrap_or_else(|_| chrono::Duration::hours(1));
    let detector = DriftDetector::new(store.clone(), clock.clone(), access_log)
        .with_grants(Arc::new(jit.clone()))
        .with_staleness(staleness);
    let violations = ViolationLog::default();
    let reporter = ComplianceReporter::new(detector.clone(), violations.clone(), clock.clone());

    AppState {
        store,
        authorizer,
        network,
        jit,
        detector,
        reporter,
        violations,
        metrics,
        clock,
        tokens: Arc::new(token_table(config)),
        eval_timeout: config.eval_timeout,
    }
}

/// The full route table. Everything under `/api/v1` is authenticated and
/// then authorized by the engine itself.
pub fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/api/v1/apply", post(policies::apply))
        .route("/api/v1/objects/{kind}", get(policies::list_objects))
        .route(
            "/api/v1/objects/{kind}/{name}",
            get(policies::get_object).delete(policies::delete_object),
        )
        .route("/api/v1/authorize", post(query::authorize))
        .route("/api/v1/network/check", post(query::check_network))
        .route(
            "/api/v1/grants",
            post(grants::request_grant).get(grants::list_grants),
        )
        .route("/api/v1/grants/{id}", get(grants::get_grant))
        .route("/api/v1/grants/{id}/approve", post(grants::approve_grant))
        .route("/api/v1/grants/{id}/revoke", post(grants::revoke_grant))
        .route("/api/v1/compliance/scan", post(compliance::scan))
        .route(
            "/api/v1/compliance/baseline",
            post(compliance::set_baseline).get(compliance::get_baseline),
        )
        .route("/api/v1/compliance/report", get(compliance::report))
        .route("/api/v1/watch", get(watch::watch_events))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rbac_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // Public routes + merged
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/metrics", get(health::metrics))
        .merge(api_routes)
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Seed default namespaces and the bootstrap RBAC that lets operators use
/// the API. The admin role lists its resources and verbs so it never shows
/// up as a wildcard finding. Existing objects are left untouched.
pub async fn seed_bootstrap_objects(store: &PolicyStore) -> anyhow::Result<()> {
    let mut seed: Vec<PolicyObject> = Vec::new();
    for name in DEFAULT_NAMESPACES {
        if store.get(&ObjectKey::namespace(name)).await.is_none() {
            seed.push(Namespace::new(name).into());
            info!("Seeded namespace: {}", name);
        }
    }

    let role = Role::cluster(
        ADMIN_CLUSTER_ROLE,
        vec![PolicyRule::new(API_RESOURCES, API_VERBS).in_group(API_GROUP)],
    );
    if store.get(&role.key()).await.is_none() {
        seed.push(role.into());
        info!("Seeded ClusterRole: {}", ADMIN_CLUSTER_ROLE);
    }
    let binding = RoleBinding::cluster(
        ADMIN_CLUSTER_BINDING,
        ADMIN_CLUSTER_ROLE,
        vec![Subject::group(OPERATORS_GROUP)],
    );
    if store.get(&binding.key()).await.is_none() {
        seed.push(binding.into());
        info!("Seeded ClusterRoleBinding: {}", ADMIN_CLUSTER_BINDING);
    }

    if !seed.is_empty() {
        store.apply(seed).await?;
    }
    Ok(())
}

pub async fn start_server(config: ServerConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let clock = system_clock();
    let store = PolicyStore::with_clock(clock.clone());
    let mut tasks = Vec::new();

    // Hydrate before anything writes, then follow the watch log.
    if config.persist {
        let backend = StateStore::open(&config.data_dir).await?;
        let persister = Persister::new(store.clone(), backend);
        persister.hydrate().await?;
        persister.resync().await?;
        tasks.push(persister.start(shutdown.clone()));
    }

    seed_bootstrap_objects(&store).await?;
    if let Some(path) = &config.policy_file {
        let objects = load_policy_file(path)?;
        let count = objects.len();
        let revision = store.apply(objects).await?;
        info!(
            "Loaded {} policy objects from {} (revision {})",
            count, path, revision
        );
    }

    let state = build_state(&config, store, clock);
    let baseline = state.detector.take_baseline().await;
    info!(
        "Initial baseline at revision {} ({} objects)",
        baseline.revision,
        baseline.objects.len()
    );

    tasks.push(
        ExpirySweeper::new(state.jit.clone(), config.sweep_interval)
            .with_metrics(state.metrics.clone())
            .start(shutdown.clone()),
    );
    tasks.push(
        DriftController::new(
            state.detector.clone(),
            state.violations.clone(),
            config.drift_interval,
        )
        .with_metrics(state.metrics.clone())
        .start(shutdown.clone()),
    );

    let app = router(state);
    info!("Starting API server on {}", config.addr);
    let listener = TcpListener::bind(config.addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await;

    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task failed during shutdown: {}", e);
        }
    }
    info!("kgate-server stopped");
    served?;
    Ok(())
}

/// Resolves on Ctrl-C or when `shutdown` is canceled elsewhere.
async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl-C: {}", e);
                shutdown.cancelled().await;
            }
            info!("Shutdown signal received");
        }
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
