use clap::Parser;
use pkg_api::server::{ServerConfig, start_server};
use pkg_constants::auth::{DEFAULT_ADMIN_TOKEN, DEFAULT_EVAL_TIMEOUT_MS};
use pkg_constants::compliance::{DEFAULT_DRIFT_INTERVAL_SECS, DEFAULT_ORPHAN_STALENESS_SECS};
use pkg_constants::jit::{
    DEFAULT_IDENTITY_TIMEOUT_MS, DEFAULT_MAX_GRANT_DURATION_SECS, DEFAULT_SWEEP_INTERVAL_SECS,
};
use pkg_constants::paths::{DEFAULT_SERVER_CONFIG, DEFAULT_SERVER_DATA_DIR, DEFAULT_SERVER_PORT};
use pkg_types::config::{ServerConfigFile, load_config_file};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kgate-server", about = "kgate access-control and policy-compliance server")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_SERVER_CONFIG)]
    config: String,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Directory for SlateDB state storage
    #[arg(long)]
    data_dir: Option<String>,

    /// Admin bearer token
    #[arg(long)]
    token: Option<String>,

    /// Policy documents (YAML or JSON) applied at startup
    #[arg(long)]
    policy_file: Option<String>,

    /// Persist the policy store under --data-dir
    #[arg(long)]
    persist: Option<bool>,

    /// JIT expiry sweep period in seconds (at most 60)
    #[arg(long)]
    sweep_interval_secs: Option<u64>,

    /// Background drift scan period in seconds
    #[arg(long)]
    drift_interval_secs: Option<u64>,

    /// Idle time after which an active grant is reported as orphaned
    #[arg(long)]
    orphan_staleness_secs: Option<u64>,

    /// Timeout for identity provider lookups
    #[arg(long)]
    identity_timeout_ms: Option<u64>,

    /// Longest grant a principal may request
    #[arg(long)]
    max_grant_duration_secs: Option<u64>,

    /// Log format: text or json
    #[arg(long)]
    log_format: Option<String>,
}

fn init_tracing(format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config file (returns defaults if file not found)
    let file_cfg: ServerConfigFile = load_config_file(&cli.config)?;

    let log_format = cli
        .log_format
        .or(file_cfg.log_format)
        .unwrap_or_else(|| "text".to_string());
    init_tracing(&log_format);
    info!("Config file: {}", cli.config);

    // Merge: CLI args > config file > defaults
    let port = cli.port.or(file_cfg.port).unwrap_or(DEFAULT_SERVER_PORT);
    let data_dir = cli
        .data_dir
        .or(file_cfg.data_dir)
        .unwrap_or_else(|| DEFAULT_SERVER_DATA_DIR.to_string());
    let token = cli
        .token
        .or(file_cfg.token)
        .unwrap_or_else(|| DEFAULT_ADMIN_TOKEN.to_string());
    let persist = cli.persist.or(file_cfg.persist).unwrap_or(false);
    let policy_file = cli.policy_file.or(file_cfg.policy_file);
    let sweep_secs = cli
        .sweep_interval_secs
        .or(file_cfg.sweep_interval_secs)
        .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);
    let drift_secs = cli
        .drift_interval_secs
        .or(file_cfg.drift_interval_secs)
        .unwrap_or(DEFAULT_DRIFT_INTERVAL_SECS);
    let staleness_secs = cli
        .orphan_staleness_secs
        .or(file_cfg.orphan_staleness_secs)
        .unwrap_or(DEFAULT_ORPHAN_STALENESS_SECS);
    let identity_timeout_ms = cli
        .identity_timeout_ms
        .or(file_cfg.identity_timeout_ms)
        .unwrap_or(DEFAULT_IDENTITY_TIMEOUT_MS);
    let max_grant_secs = cli
        .max_grant_duration_secs
        .or(file_cfg.max_grant_duration_secs)
        .unwrap_or(DEFAULT_MAX_GRANT_DURATION_SECS);

    info!("Starting kgate-server");
    info!("  Port:      {}", port);
    info!("  Data dir:  {} (persist={})", data_dir, persist);
    info!("  Token:     {}***", token.chars().take(4).collect::<String>());
    if let Some(path) = &policy_file {
        info!("  Policies:  {}", path);
    }
    if !file_cfg.groups.is_empty() {
        info!("  Identity:  {} principals with static groups", file_cfg.groups.len());
    }
    if !file_cfg.users.is_empty() {
        info!("  API users: {} besides the admin", file_cfg.users.len());
    }

    let config = ServerConfig {
        addr: SocketAddr::from(([0, 0, 0, 0], port)),
        data_dir,
        persist,
        admin_token: token,
        policy_file,
        sweep_interval: Duration::from_secs(sweep_secs),
        drift_interval: Duration::from_secs(drift_secs),
        orphan_staleness: Duration::from_secs(staleness_secs),
        identity_timeout: Duration::from_millis(identity_timeout_ms),
        eval_timeout: Duration::from_millis(DEFAULT_EVAL_TIMEOUT_MS),
        max_grant_duration_secs: max_grant_secs,
        groups: file_cfg.groups,
        users: file_cfg.users,
    };

    start_server(config).await?;

    Ok(())
}
