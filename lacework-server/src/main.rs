//! Lacework Lease Controller
//!
//! Hands out overlay subnets to underlay hosts, backed by a shared SQL database

use anyhow::{Context, Result};
use axum::{
    routing::{get, post, put},
    Router,
};
use clap::Parser;
use lacework_common::{network::CidrPool, protocol::endpoints};
use lacework_store::{Database, LeaseRepository, LeaseStore};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::watch};
use tower::ServiceBuilder;
use tracing::{info, warn};

mod config;
mod handlers;
mod leaser;
mod middleware;
mod sweeper;

use leaser::LeaseAllocator;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "lacework.toml", env = "LACEWORK_CONFIG")]
    config: String,

    /// Database URL (overrides config)
    #[arg(long)]
    database_url: Option<String>,

    /// Bind address (overrides config)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Log level (overrides config)
    #[arg(long)]
    log_level: Option<String>,
}

/// Application state shared across handlers
struct AppState<S> {
    allocator: Arc<LeaseAllocator<S>>,
    prometheus: Option<PrometheusHandle>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            allocator: self.allocator.clone(),
            prometheus: self.prometheus.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = config::load_config(&args.config)?;

    // Override config with command line arguments
    if let Some(url) = args.database_url {
        config.database.url = url;
    }
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(log_level) = args.log_level {
        config.log_level = log_level;
    }

    init_tracing(&config.log_level)?;

    info!("Starting Lacework lease controller v{}", env!("CARGO_PKG_VERSION"));

    config.validate().context("Invalid configuration")?;
    info!(
        driver = %config.database.driver,
        database = %config.database.redacted_url(),
        subnet_range = %config.network.subnet_range,
        subnet_prefix = config.network.subnet_prefix_length,
        "Configuration loaded"
    );

    let prometheus = if config.metrics_config.enabled {
        Some(init_metrics()?)
    } else {
        None
    };

    let db = Database::connect(&config.database)
        .await
        .context("Failed to connect to lease database")?;
    let repository = LeaseRepository::new(db);
    let applied = repository
        .migrate()
        .await
        .context("Failed to migrate lease database")?;
    info!(applied, "Lease database ready");

    let pool = CidrPool::new(
        &config.network.subnet_range,
        config.network.subnet_prefix_length,
    )?;
    let allocator = Arc::new(LeaseAllocator::new(repository, pool, &config.leases));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = tokio::spawn(sweeper::run(
        allocator.clone(),
        Duration::from_secs(config.leases.sweep_interval_secs),
        shutdown_rx.clone(),
    ));

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let app_state = AppState {
        allocator,
        prometheus,
    };

    // Build the application router
    let app = build_router(
        app_state,
        Duration::from_secs(config.request_timeout_secs),
        &config.metrics_config.metrics_path,
    );

    // Start the server
    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_address))?;

    info!("Lacework controller listening on {}", config.bind_address);

    let mut server_shutdown = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*server_shutdown.borrow() {
                if server_shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("Server error")?;

    sweeper.await.context("Lease sweeper panicked")?;
    info!("Lacework controller stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let log_level = log_level.parse::<tracing::Level>()
        .context("Invalid log level")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    format!("lacework_server={},lacework_store={}", log_level, log_level).into()
                })
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Install the Prometheus recorder and keep its histograms drained
fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    let upkeep = handle.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            upkeep.run_upkeep();
        }
    });

    Ok(handle)
}

/// Build the application router with all routes
fn build_router<S: LeaseStore + 'static>(
    state: AppState<S>,
    request_timeout: Duration,
    metrics_path: &str,
) -> Router {
    Router::new()
        // Health check endpoint
        .route(endpoints::HEALTH, get(handlers::health_check::<S>))

        // API v1 routes
        .route(endpoints::ACQUIRE_LEASE, post(handlers::acquire_lease::<S>))
        .route(endpoints::RENEW_LEASE, put(handlers::renew_lease::<S>))
        .route(endpoints::RELEASE_LEASE, post(handlers::release_lease::<S>))
        .route(endpoints::ROUTABLE_LEASES, get(handlers::routable_leases::<S>))

        // Metrics endpoint
        .route(metrics_path, get(handlers::metrics_handler::<S>))

        // Add middleware
        .layer(
            ServiceBuilder::new()
                .layer(middleware::logging_middleware())
                .layer(middleware::timeout_middleware(request_timeout)),
        )

        // Add shared state
        .with_state(state)
}
