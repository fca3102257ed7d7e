use std::sync::Arc;

use axum::Router;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use giftflow::config::Config;
use giftflow::db::{create_pool, init_audit_db, init_db, AppState};
use giftflow::handlers;
use giftflow::payments::{PayPalClient, ProcessorRegistry, StripeClient};

#[derive(Parser, Debug)]
#[command(name = "giftflow")]
#[command(about = "Payment reconciliation service for the Giftflow donation platform")]
struct Cli {
    /// Delete databases on exit (dev mode only, useful for fresh starts)
    #[arg(long)]
    ephemeral: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "giftflow=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env();

    if config.dev_mode {
        tracing::info!("Running in DEVELOPMENT mode");
    }

    // Processor credentials are fatal configuration: a reconciliation
    // service with no processors cannot do anything useful.
    let stripe = config.stripe.as_ref().map(StripeClient::new);
    let paypal = config.paypal.as_ref().map(PayPalClient::new);
    let processors = ProcessorRegistry::new(stripe, paypal);
    if processors.configured().is_empty() {
        panic!("no payment processor configured; set STRIPE_* or PAYPAL_* credentials");
    }
    tracing::info!(
        "Configured processors: {:?}",
        processors
            .configured()
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
    );

    // Create database connection pools
    let db_pool = create_pool(&config.database_path).expect("Failed to create database pool");
    let audit_pool =
        create_pool(&config.audit_database_path).expect("Failed to create audit database pool");

    // Initialize database schemas
    {
        let conn = db_pool.get().expect("Failed to get connection");
        init_db(&conn).expect("Failed to initialize database");
    }
    {
        let conn = audit_pool.get().expect("Failed to get audit connection");
        init_audit_db(&conn).expect("Failed to initialize audit database");
    }

    let state = AppState {
        db: db_pool,
        audit: audit_pool,
        processors: Arc::new(processors),
        fees: Arc::new(config.fee_calculator()),
        http_client: reqwest::Client::new(),
        notify_webhook_url: config.notify_webhook_url.clone(),
        audit_log_enabled: config.audit_log_enabled,
        dunning_max_attempts: config.dunning_max_attempts,
    };

    // Build the application router
    let app = Router::new()
        // Application-layer surface (role header from trusted upstream)
        .merge(handlers::gifts::router())
        .merge(handlers::plans::router())
        .merge(handlers::audit_logs::router())
        // Webhook endpoints (processor signature auth)
        .merge(handlers::webhooks::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start the server
    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    let cleanup_on_exit = cli.ephemeral && config.dev_mode;
    let db_path = config.database_path.clone();
    let audit_path = config.audit_database_path.clone();

    if cleanup_on_exit {
        tracing::info!("EPHEMERAL MODE: databases will be deleted on exit");
    }

    tracing::info!("Giftflow server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Failed to start server");

    if cleanup_on_exit {
        tracing::info!("Cleaning up ephemeral databases...");
        for path in [&db_path, &audit_path] {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!("Failed to remove {}: {}", path, e);
            } else {
                tracing::info!("Removed {}", path);
            }
            let _ = std::fs::remove_file(format!("{}-wal", path));
            let _ = std::fs::remove_file(format!("{}-shm", path));
        }
        tracing::info!("Ephemeral cleanup complete");
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("Shutdown signal received, stopping server...");
}
