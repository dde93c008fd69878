use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use pullcache::config::{self, Config, LockBackend, StoreBackend};
use pullcache::coordination::{
    redis::create_keydb_pool, KeyDbCacheStore, KeyDbKeyedMutex, KeyedMutex, LocalKeyedMutex,
    MemoryCacheStore, SharedCacheStore,
};
use pullcache::coordinator::Coordinator;
use pullcache::health::HealthState;
use pullcache::http::create_router;
use pullcache::metrics::MetricsRegistry;
use pullcache::node::{node_id, NodeService};
use pullcache::peer::HttpPeerRequester;
use pullcache::registry::{HttpOriginRegistry, RetryPolicy, RetryingClient};
use pullcache::torrent::MetainfoGenerator;
use pullcache::AppState;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "pullcache", about = "Cluster-local container image pull coordinator")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/run/pullcache/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Coordination backends
// ---------------------------------------------------------------------------

async fn build_coordination(
    config: &Config,
    node_id: &str,
) -> Result<(
    Arc<dyn KeyedMutex>,
    Arc<dyn SharedCacheStore>,
    Option<fred::clients::Pool>,
)> {
    let pool = match &config.keydb {
        Some(keydb) => Some(create_keydb_pool(keydb).await?),
        None => None,
    };

    let locks: Arc<dyn KeyedMutex> = match (config.coordination.lock_backend, &pool) {
        (LockBackend::Keydb, Some(pool)) => Arc::new(KeyDbKeyedMutex::new(
            pool.clone(),
            node_id.to_string(),
            config.coordination.lock_ttl,
        )),
        (LockBackend::Keydb, None) => anyhow::bail!("lock_backend keydb requires a keydb section"),
        (LockBackend::Local, _) => Arc::new(LocalKeyedMutex::new()),
    };

    let store: Arc<dyn SharedCacheStore> = match (config.coordination.store_backend, &pool) {
        (StoreBackend::Keydb, Some(pool)) => Arc::new(KeyDbCacheStore::new(pool.clone())),
        (StoreBackend::Keydb, None) => {
            anyhow::bail!("store_backend keydb requires a keydb section")
        }
        (StoreBackend::Memory, _) => Arc::new(MemoryCacheStore::new()),
    };

    tracing::info!(
        lock_backend = ?config.coordination.lock_backend,
        store_backend = ?config.coordination.store_backend,
        "coordination backends initialised"
    );
    Ok((locks, store, pool))
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .node
        .listen
        .parse()
        .context("invalid node.listen address")?;
    let app = create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = Arc::new(config::load_config(&cli.config)?);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting pullcache");

    // ---- Ensure storage directories exist ----
    for dir in [
        &config.storage.small_files_dir,
        &config.storage.layers_dir,
        &config.storage.oci_dir,
    ] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create storage dir: {}", dir.display()))?;
    }

    // ---- Node ID ----
    let node_id = node_id();
    tracing::info!(%node_id, advertise = %config.node.advertise_address, "node identity established");

    // ---- Infrastructure clients ----
    let (locks, store, keydb) = build_coordination(&config, &node_id).await?;

    let http_client = reqwest::Client::builder()
        .user_agent("pullcache/0.1")
        .build()
        .context("failed to build reqwest client")?;

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Origin, torrents, node service ----
    let origin = Arc::new(HttpOriginRegistry::new(RetryingClient::new(
        http_client.clone(),
        RetryPolicy::default(),
    )));
    let torrents = Arc::new(
        MetainfoGenerator::new(
            config.distribution.torrent_piece_length,
            config.distribution.torrent_announce.clone(),
        )
        .context("invalid torrent settings")?,
    );
    let node = Arc::new(NodeService::new(
        Arc::clone(&config),
        origin.clone(),
        torrents,
        Arc::clone(&metrics.metrics),
    ));

    // ---- Coordinator ----
    let coordinator = Arc::new(Coordinator::new(
        Arc::clone(&config),
        Arc::clone(&node),
        origin,
        locks,
        store,
        Arc::new(HttpPeerRequester::new(http_client)),
        Arc::clone(&metrics.metrics),
    ));
    tracing::info!(peers = config.peers.len(), "coordinator initialised");

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        node,
        coordinator,
        metrics,
        health: HealthState {
            config: Arc::clone(&config),
            keydb,
        },
    };

    run_http_server(state).await?;

    tracing::info!("pullcache shut down cleanly");
    Ok(())
}
