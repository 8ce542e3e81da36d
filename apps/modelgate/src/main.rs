use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use modelgate_gateway::{
    router, ConfigCipher, DeploymentResolver, GatewayState, Kv, ProxyEngine, RateLimiter,
    SpendQueue, SpendWorker,
};
use modelgate_storage::{GatewayStorage, SettlementWriter, SpendLog};

mod cli;
mod config;

use crate::cli::Cli;
use crate::config::Config;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("modelgate failed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let cipher = ConfigCipher::new(&config.encryption_key)?;

    let storage = GatewayStorage::connect(&config.database_url).await?;
    info!("db connected");
    storage.sync().await?;

    let kv = Kv::connect(&config.kv)?;
    kv.ping().await?;
    info!(host = %config.kv.host, port = config.kv.port, "kv connected");

    let spend_log = SpendLog::new(config.analytics.clone());
    spend_log.ensure_schema().await?;

    let engine = ProxyEngine::new(config.request_timeout)?;
    let resolver = DeploymentResolver::new(kv.clone(), storage.clone(), cipher);
    // Cached deployments from a previous config generation don't survive a restart.
    match resolver.invalidate().await {
        Ok(dropped) => info!(dropped, "deployment cache invalidated"),
        Err(err) => tracing::warn!(error = %err, "deployment cache invalidation failed"),
    }
    let limiter = RateLimiter::new(kv.clone(), config.default_rate_limit_rpm);
    let queue = SpendQueue::new(kv.clone());

    let settlement =
        SettlementWriter::new(storage.connection().clone(), config.credit_multiplier);
    let worker = SpendWorker::new(
        queue.clone(),
        settlement,
        spend_log,
        config.spend_interval,
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    let state = Arc::new(GatewayState {
        storage: storage.clone(),
        resolver,
        limiter,
        engine,
        queue,
        free_models: config.free_models.clone(),
    });
    let app = router(state);

    let bind = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(addr = %bind, free_models = config.free_models.len(), "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the spend timer; the worker makes one final leased drain on its way out.
    let _ = shutdown_tx.send(true);
    let _ = worker_handle.await;
    storage.close().await?;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("modelgate=info,sea_orm=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
