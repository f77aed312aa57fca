use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lis_core::config::{flag_from_env_value, parse_env_value};
use lis_core::constants::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_CONVERSION_SCALE, DEFAULT_IDLE_THRESHOLD_DAYS,
    DEFAULT_QUERY_TIMEOUT_SECS, DEFAULT_SWEEP_INTERVAL_SECS,
};
use lis_core::router::{HandlerRegistry, LineInserter};
use lis_core::seed::load_seed_file;
use lis_core::store::InMemoryStore;
use lis_core::{CoreConfig, CoreResult, Engine};
use lis_uuid::EntityId;

/// Hands translated lines to the log until a results store is attached.
struct TracingLineInserter;

impl LineInserter for TracingLineInserter {
    fn insert(&self, analyzer_id: EntityId, lines: &[String]) -> CoreResult<()> {
        tracing::info!("delivered {} line(s) from analyzer {}", lines.len(), analyzer_id);
        Ok(())
    }
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Resolve [`CoreConfig`] from the environment.
///
/// # Environment Variables
/// - `LIS_SEED_FILE`: seed YAML with analyzers, mappings and handlers (optional)
/// - `LIS_IDLE_THRESHOLD_DAYS`: days an ACTIVE analyzer may be silent (default: 7)
/// - `LIS_CONVERSION_SCALE`: decimal places kept after unit conversion (default: 5)
/// - `LIS_SWEEP_INTERVAL_SECS`: seconds between idle sweeps (default: 86400)
/// - `LIS_CONNECT_TIMEOUT_SECS`: analyzer connect timeout (default: 5)
/// - `LIS_QUERY_TIMEOUT_SECS`: wall-clock limit for one query job (default: 300)
/// - `LIS_ALLOW_LOOPBACK_QUERIES`: permit queries to loopback simulators (default: false)
fn config_from_env() -> anyhow::Result<CoreConfig> {
    let idle_days = parse_env_value(
        "LIS_IDLE_THRESHOLD_DAYS",
        env("LIS_IDLE_THRESHOLD_DAYS"),
        DEFAULT_IDLE_THRESHOLD_DAYS,
    )?;
    let scale = parse_env_value(
        "LIS_CONVERSION_SCALE",
        env("LIS_CONVERSION_SCALE"),
        DEFAULT_CONVERSION_SCALE,
    )?;
    let sweep = parse_env_value(
        "LIS_SWEEP_INTERVAL_SECS",
        env("LIS_SWEEP_INTERVAL_SECS"),
        DEFAULT_SWEEP_INTERVAL_SECS,
    )?;
    let connect = parse_env_value(
        "LIS_CONNECT_TIMEOUT_SECS",
        env("LIS_CONNECT_TIMEOUT_SECS"),
        DEFAULT_CONNECT_TIMEOUT_SECS,
    )?;
    let query = parse_env_value(
        "LIS_QUERY_TIMEOUT_SECS",
        env("LIS_QUERY_TIMEOUT_SECS"),
        DEFAULT_QUERY_TIMEOUT_SECS,
    )?;

    let seed_file = env("LIS_SEED_FILE")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from);

    Ok(CoreConfig::new(
        idle_days,
        scale,
        Duration::from_secs(sweep),
        Duration::from_secs(connect),
        Duration::from_secs(query),
    )?
    .with_loopback_queries(flag_from_env_value(env("LIS_ALLOW_LOOPBACK_QUERIES")))
    .with_seed_file(seed_file))
}

/// Main entry point for the analyzer integration engine
///
/// Loads configuration and the optional seed, then runs the idle sweep until Ctrl-C.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("lis=info".parse()?))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(config_from_env()?);
    let inserter: Arc<dyn LineInserter> = Arc::new(TracingLineInserter);

    let engine = match config.seed_file() {
        Some(path) => {
            tracing::info!("++ Loading seed from {}", path.display());
            Engine::from_seed(config.clone(), load_seed_file(path)?, inserter, None)?
        }
        None => {
            tracing::warn!("LIS_SEED_FILE not set; starting with an empty configuration");
            Engine::new(
                config.clone(),
                Arc::new(InMemoryStore::new()),
                HandlerRegistry::new(),
                None,
            )
        }
    };

    tracing::info!(
        "++ Idle sweep every {}s, threshold {} day(s)",
        config.sweep_interval().as_secs(),
        config.idle_threshold().num_days()
    );
    let sweep = engine.spawn_idle_sweep();

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    sweep.abort();

    Ok(())
}
