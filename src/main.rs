use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::admission::AdmissionGuard;
use turnstile::config::{Cli, LoggingConfig, StoreBackend, TurnstileConfig};
use turnstile::grpc::GrpcServer;
use turnstile::ratelimit::{
    Algorithm, Clock, DistributedRateLimiter, Janitor, LocalWindowStore, RateLimiter,
    RateLimiterBackend, RedisSortedSet, RouteTable, SharedWindowStore, SystemClock,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = TurnstileConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    init_tracing(&config.logging)?;

    info!("Starting Turnstile admission service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        grpc_addr = %config.server.grpc_addr,
        backend = ?config.store.backend,
        "Configuration loaded"
    );

    let routes = match &config.rate_limiting.routes_path {
        Some(path) => RouteTable::from_file(path)?,
        None => {
            warn!("No route rules configured, every route is unlimited");
            RouteTable::new()
        }
    };
    info!(rules = routes.len(), key_prefix = %routes.key_prefix(), "Route table loaded");
    let routes = Arc::new(routes);

    match config.store.backend {
        StoreBackend::Local => {
            let clock: Arc<dyn Clock> = Arc::new(SystemClock);
            let store = Arc::new(LocalWindowStore::new());
            let limiter = Arc::new(RateLimiter::with_store(store.clone(), clock.clone()));

            let janitor = Janitor::with_interval(store, clock, config.store.janitor_interval());
            janitor.start();

            let result = serve(config.server.grpc_addr, limiter, routes).await;

            janitor.stop().await;
            result?;
        }
        StoreBackend::Shared => {
            let url = config
                .store
                .redis_url
                .as_deref()
                .context("store.redis_url is required for the shared backend")?;
            let backend = RedisSortedSet::open(url, config.store.operation_timeout())?;
            let store = SharedWindowStore::new(Arc::new(backend), config.store.namespace.clone());
            let limiter = Arc::new(DistributedRateLimiter::new(store));

            serve(config.server.grpc_addr, limiter, routes).await?;
        }
    }

    info!("Turnstile admission service stopped");
    Ok(())
}

async fn serve<R: RateLimiterBackend + 'static>(
    addr: SocketAddr,
    limiter: Arc<R>,
    routes: Arc<RouteTable>,
) -> anyhow::Result<()> {
    info!(algorithm = %limiter.algorithm(), "Rate limiter initialized");
    if limiter.algorithm() == Algorithm::FixedWindow {
        info!("Fixed windows admit up to twice max_requests across a window boundary");
    }

    let guard = Arc::new(AdmissionGuard::new(limiter, routes));
    let grpc_server = GrpcServer::new(addr, guard);

    info!("Starting gRPC server on {}", addr);

    // Run the server with graceful shutdown on Ctrl+C
    grpc_server.serve_with_shutdown(shutdown_signal()).await?;
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&logging.level)
            .with_context(|| format!("invalid log level {:?}", logging.level))?,
    };

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
