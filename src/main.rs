use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use fleet_indexer::cache::ClusterCache;
use fleet_indexer::clustersync::{ClusterSyncer, RetryPolicy};
use fleet_indexer::config::Config;
use fleet_indexer::db::postgres::PgStore;
use fleet_indexer::db::Store;
use fleet_indexer::logging::init_logging;
use fleet_indexer::metrics::Metrics;
use fleet_indexer::server::limiter::RequestTracker;
use fleet_indexer::server::{build_router, shutdown_signal, AppState};

const DELETE_RETRY_ATTEMPTS: u32 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::parse();
    let root = init_logging(&config.pod_name, &config.pod_namespace)?;
    run(config).instrument(root).await
}

async fn run(config: Config) -> Result<()> {
    config.log_summary();

    let metrics = Arc::new(Metrics::new().context("failed to register metrics")?);

    let db_ready = Arc::new(AtomicBool::new(false));
    let pg = PgStore::connect(&config).await;
    pg.initialize_schema(config.development_mode)
        .await
        .context("database schema initialization failed")?;
    db_ready.store(true, Ordering::Relaxed);
    let store: Arc<dyn Store> = Arc::new(pg);

    let cache = Arc::new(ClusterCache::default());
    let token = CancellationToken::new();

    let syncer = ClusterSyncer::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        RetryPolicy::new(DELETE_RETRY_ATTEMPTS, config.max_backoff()),
    );
    let lifecycle = match kube::Client::try_default().await {
        Ok(client) => Some(tokio::spawn(
            syncer
                .run(client, config.rediscover_rate(), token.child_token())
                .in_current_span(),
        )),
        Err(err) => {
            warn!(error = %err, "control plane unavailable; cluster lifecycle disabled");
            None
        }
    };

    let state = AppState {
        store,
        tracker: Arc::new(RequestTracker::new(config.request_limit)),
        metrics,
        batch_size: config.db_batch_size,
        request_timeout: config.http_timeout(),
        db_ready,
    };
    let app = build_router(state);

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(bind = %config.bind, "server listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(token.clone()))
        .await
        .context("server shutdown")?;

    if let Some(task) = lifecycle {
        let _ = task.await;
    }

    Ok(())
}
