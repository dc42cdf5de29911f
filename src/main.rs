//! dcabot — multi-user spot DCA execution engine.
//!
//! Webhook signals become layered limit-order grids; background loops
//! reconcile fills, place take-profits, promote queued signals, and offset
//! ripe losers against winners.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dcabot_backend::{
    api,
    auth::CredentialCipher,
    cache::MemoryCache,
    engine::{
        fill_monitor::OrderFillMonitor, queue::QueuePromoter, risk::RiskEngineService,
        EngineContext, EngineSettings,
    },
    exchange::LiveConnectorFactory,
    models::Config,
    precision::{PrecisionCache, PrecisionCacheConfig},
    state::AppState,
    store::EngineDb,
};

/// Exit codes: 0 clean shutdown, 1 config failure, 2 DB unreachable.
const EXIT_CONFIG_FAILURE: i32 = 1;
const EXIT_DB_UNREACHABLE: i32 = 2;

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(EXIT_CONFIG_FAILURE);
        }
    };
    init_tracing(&config);

    let db_path = database_path(&config.database_url);
    let db = match EngineDb::new(&db_path) {
        Ok(db) => db,
        Err(e) => {
            error!("Database unreachable at {db_path}: {e}");
            std::process::exit(EXIT_DB_UNREACHABLE);
        }
    };
    info!(path = %db_path, "database initialized");

    if let Err(e) = run(config, db).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(config: Config, db: EngineDb) -> Result<()> {
    let cache = Arc::new(MemoryCache::new());
    let cipher = Arc::new(CredentialCipher::new(&config.encryption_key));
    let connectors = Arc::new(LiveConnectorFactory::new(cipher.clone()));
    let precision = Arc::new(PrecisionCache::new(PrecisionCacheConfig::default()));

    let settings = EngineSettings {
        fill_monitor_interval_secs: config.fill_monitor_interval_secs,
        risk_engine_interval_secs: config.risk_engine_interval_secs,
        queue_promoter_interval_secs: config.queue_promoter_interval_secs,
        ..EngineSettings::default()
    };
    let ctx = EngineContext {
        db,
        cache,
        connectors,
        precision,
        settings,
    };

    // Background loops exit cooperatively: the current iteration completes,
    // then the loop returns.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let fill_monitor = tokio::spawn(OrderFillMonitor::new(ctx.clone()).run(shutdown_rx.clone()));
    let risk_engine = tokio::spawn(RiskEngineService::new(ctx.clone()).run(shutdown_rx.clone()));
    let queue_promoter = tokio::spawn(QueuePromoter::new(ctx.clone()).run(shutdown_rx.clone()));
    info!("background loops started (fill monitor, risk engine, queue promoter)");

    let state = AppState::new(config.clone(), ctx);
    let app = api::build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, environment = %config.environment, "dcabot listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown signal received, stopping background loops");
    shutdown_tx.send(true).ok();
    let _ = tokio::time::timeout(std::time::Duration::from_secs(30), async {
        let _ = fill_monitor.await;
        let _ = risk_engine.await;
        let _ = queue_promoter.await;
    })
    .await;

    info!("clean shutdown");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    // The logs surface tails LOG_FILE_PATH; mirror output there when writable.
    if let Some(parent) = std::path::Path::new(&config.log_file_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_file_path)
    {
        Ok(file) => {
            let file = Arc::new(file);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(move || {
                            file.try_clone().expect("clone log file handle")
                        }),
                )
                .init();
        }
        Err(e) => {
            registry.init();
            eprintln!(
                "warning: log file {} not writable ({e}); logging to stdout only",
                config.log_file_path
            );
        }
    }
}

/// Accepts `sqlite:///var/lib/dcabot.db`, `sqlite://dcabot.db`, or a bare
/// filesystem path.
fn database_path(database_url: &str) -> String {
    database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url)
        .to_string()
}
