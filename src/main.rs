//! Serengeti Node — Main Entry Point
//!
//! Wires every subsystem together and runs until ctrl-c: the HTTP boundary,
//! the discovery sweep, the reshuffle worker, the persistence scheduler and
//! the storage maintenance loop.
//!
//! Exit codes: 0 on clean shutdown, 1 on fatal startup failure, 2 when the
//! data directory is unusable (disk or permission error).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use serengeti::catalog::persistence::PersistenceScheduler;
use serengeti::catalog::Catalog;
use serengeti::cluster::{
    detect_local_ip, load_or_create_node_id, Discovery, Membership, ReshuffleWorker, Transport,
};
use serengeti::config::{Config, DATA_PATH_ENV};
use serengeti::metrics::Metrics;
use serengeti::query::cache::QueryCache;
use serengeti::query::executor::QueryExecutor;
use serengeti::query::memory::MemoryManager;
use serengeti::server::{self, AppState};
use serengeti::SerengetiError;

/// Autonomous, self-clustering distributed database node.
#[derive(Debug, Parser)]
#[command(name = "serengeti", version, about)]
struct Args {
    /// HTTP port serving queries, metrics and cluster messages.
    #[arg(long)]
    port: Option<u16>,

    /// Reserved discovery port (not bound; discovery probes over HTTP).
    #[arg(long)]
    discovery_port: Option<u16>,

    /// Data directory. Overridden by SERENGETI_DATA_PATH when set.
    #[arg(long)]
    data_path: Option<PathBuf>,

    /// Log filter, e.g. `info` or `serengeti=debug`.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            return ExitCode::from(1);
        }
    };
    match runtime.block_on(run_node(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(SerengetiError::Io(e)) => {
            error!(error = %e, "data directory unusable");
            ExitCode::from(2)
        }
        Err(e) => {
            error!(error = %e, "fatal startup failure");
            ExitCode::from(1)
        }
    }
}

fn build_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.node.http_port = port;
    }
    if let Some(port) = args.discovery_port {
        config.node.discovery_port = port;
    }
    if let Some(path) = &args.data_path {
        config.node.data_path = path.clone();
    }
    config.apply_env_overrides();
    Ok(config)
}

async fn run_node(config: Config) -> serengeti::SerengetiResult<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.node.http_port,
        data_path = %config.node.data_path.display(),
        "🚀 starting serengeti node"
    );
    if std::env::var(DATA_PATH_ENV).is_ok() {
        info!("data path taken from {DATA_PATH_ENV}");
    }

    // Identity and shared registries.
    std::fs::create_dir_all(&config.node.data_path)?;
    let node_id = load_or_create_node_id(&config.node.data_path)?;
    let local_ip = detect_local_ip();
    let metrics = Arc::new(Metrics::new());
    let membership = Arc::new(Membership::new(node_id, local_ip));
    info!(node = %node_id, ip = %local_ip, "node identity ready");

    // Storage + catalog.
    let catalog = Arc::new(Catalog::open(
        &config.node.data_path,
        config.storage.clone(),
    )?);

    // Cluster plumbing.
    let transport = Arc::new(Transport::new(
        membership.clone(),
        metrics.clone(),
        config.node.http_port,
        config.cluster.network_timeout_ms,
    ));
    let (lost_tx, lost_rx) = mpsc::unbounded_channel();
    let discovery = Arc::new(Discovery::new(
        membership.clone(),
        metrics.clone(),
        config.cluster.clone(),
        config.node.http_port,
        lost_tx,
    ));
    let reshuffle = Arc::new(ReshuffleWorker::new(
        membership.clone(),
        transport.clone(),
        catalog.clone(),
        config.cluster.clone(),
    ));

    // Query engine.
    let memory = Arc::new(MemoryManager::new(
        config.query_pool_bytes(),
        config.node.data_path.join("spill"),
        metrics.clone(),
    ));
    let cache = Arc::new(QueryCache::new(
        Duration::from_millis(config.query.cache_ttl_ms),
        config.query.cache_max_entries,
    ));
    let executor = Arc::new(QueryExecutor::new(
        catalog.clone(),
        membership.clone(),
        transport.clone(),
        memory,
        cache,
        metrics.clone(),
        config.query.clone(),
    ));

    // Persistence scheduler.
    let scheduler = Arc::new(PersistenceScheduler::new(
        catalog.clone(),
        membership.clone(),
        metrics.clone(),
        config.persistence.clone(),
    ));

    // Background workers, all stopped through one shutdown channel.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::new();
    workers.push(tokio::spawn(discovery.clone().run(shutdown_rx.clone())));
    workers.push(tokio::spawn(
        reshuffle.clone().run(lost_rx, shutdown_rx.clone()),
    ));
    workers.push(tokio::spawn(scheduler.clone().run(shutdown_rx.clone())));
    workers.push(tokio::spawn(storage_maintenance(
        catalog.clone(),
        metrics.clone(),
        config.storage.compaction_interval_ms,
        shutdown_rx.clone(),
    )));

    let state = Arc::new(AppState {
        membership: membership.clone(),
        catalog,
        executor,
        scheduler,
        metrics,
        config: config.clone(),
    });
    let http = tokio::spawn(server::serve(state, shutdown_rx));

    info!(
        "🌐 serengeti node is up: http://{}:{} (query: /query, health: /health, metrics: /metrics)",
        local_ip, config.node.http_port
    );

    tokio::signal::ctrl_c().await.map_err(SerengetiError::Io)?;
    info!("🛑 shutdown signal received, draining workers");
    membership.set_online(false);
    let _ = shutdown_tx.send(true);

    let drain = async {
        for worker in workers {
            let _ = worker.await;
        }
        let _ = http.await;
    };
    if tokio::time::timeout(
        Duration::from_millis(config.node.shutdown_timeout_ms),
        drain,
    )
    .await
    .is_err()
    {
        warn!("workers did not drain in time; forcing exit");
    }

    info!("👋 serengeti node stopped");
    Ok(())
}

/// Periodic flush + compaction sweep over every table engine. Per-engine
/// single-flight is enforced inside `maybe_compact`.
async fn storage_maintenance(
    catalog: Arc<Catalog>,
    metrics: Arc<Metrics>,
    interval_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_millis(interval_ms.max(100));
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
        for db in catalog.list_databases() {
            let Ok(tables) = catalog.list_tables(&db) else { continue };
            for table in tables {
                let Ok(handle) = catalog.table(&db, &table) else { continue };
                match handle.engine.flush_frozen() {
                    Ok(flushed) if flushed > 0 => {
                        Metrics::add(&metrics.memtable_flushes, flushed as u64);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(db = %db, table = %table, error = %e, "background flush failed"),
                }
                match handle.engine.maybe_compact() {
                    Ok(true) => Metrics::incr(&metrics.compactions),
                    Ok(false) => {}
                    Err(e) => warn!(db = %db, table = %table, error = %e, "compaction failed"),
                }
            }
        }
    }
}
