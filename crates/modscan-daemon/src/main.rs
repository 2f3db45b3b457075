// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use modscan_chains::FileChainStore;
use modscan_config::{load_config, validate_config};
use modscan_daemon::middleware::{request_id_middleware, request_logger};
use modscan_daemon::{AppState, build_app};
use modscan_dispatcher::{AutoRunSettings, Dispatcher};
use modscan_executor::ChainExecutor;
use modscan_queue::RedisQueuePlane;
use modscan_registry::{ModuleRegistry, ProcessContainerDriver};
use modscan_report::ReportStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "modscan-daemon", version, about = "modscan orchestrator daemon")]
struct Args {
    /// Path to a TOML configuration file. Falls back to built-in defaults
    /// (overridable by `MODSCAN_*` env vars) when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(args.config.as_deref()).context("load configuration")?;
    let warnings = validate_config(&config).context("validate configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.log_level))
        .init();

    for warning in &warnings {
        warn!(%warning, "configuration warning");
    }

    let store_root = PathBuf::from(&config.store_root);
    let modules_dir = PathBuf::from(&config.modules_dir);
    let chains_root = store_root.join("chains");
    let reports_root = store_root.join("reports");

    let queue: Arc<dyn modscan_queue::QueuePlane> = Arc::new(
        RedisQueuePlane::connect(&config.redis_url)
            .await
            .context("connect to redis")?,
    );
    let registry = ModuleRegistry::new(
        modules_dir.clone(),
        Arc::new(ProcessContainerDriver::default()),
        config.n_build_retries,
        queue.clone(),
    );
    registry.bootstrap().await.context("bootstrap module registry")?;

    let chains: Arc<dyn modscan_chains::ChainStore> =
        Arc::new(FileChainStore::new(chains_root).context("open chain store")?);
    let reports = ReportStore::new(reports_root)
        .await
        .context("open report store")?;
    let store = modscan_store::ArtifactStore::new(store_root.join("artifacts"))
        .await
        .context("open artifact store")?;

    let executor = ChainExecutor::new(
        queue.clone(),
        registry.clone(),
        chains.clone(),
        reports.clone(),
        config.default_step_timeout_secs,
        config.lost_task_grace_secs,
    );

    let reconciled = executor
        .reconcile_on_startup(100)
        .await
        .context("reconcile in-flight chain runs")?;
    if reconciled > 0 {
        info!(reconciled, "reconciled in-flight chain runs from a prior process");
    }

    let settings = AutoRunSettings::new(Default::default());
    let dispatcher = Dispatcher::new(executor.clone(), settings.clone());

    registry.spawn_health_probe_task(Duration::from_secs(config.health_probe_interval_secs));

    let state = Arc::new(AppState::new(
        registry, chains, executor, dispatcher, settings, reports, queue, store,
    ));

    let app = build_app(state)
        .layer(axum::middleware::from_fn(request_logger))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    info!(bind = %config.bind_addr, "modscan-daemon listening");

    axum::serve(listener, app).await.context("serve")
}
