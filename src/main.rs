use settlement_backend::api::{self, payments::PaymentsState};
use settlement_backend::config::{AppConfig, LoggingConfig};
use settlement_backend::database::in_memory::InMemoryPaymentRecordStore;
use settlement_backend::database::payment_record_repository::{
    PaymentRecordStore, PgPaymentRecordRepository,
};
use settlement_backend::database::{init_pool_from_config, run_migrations};
use settlement_backend::health::HealthChecker;
use settlement_backend::logging::init_tracing;
use settlement_backend::payments::{InMemoryOrderDirectory, OrderCollaborator, PgOrderDirectory};

use dotenv::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_tracing(&LoggingConfig::from_env()?);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting settlement backend"
    );

    // Missing gateway secret or merchant code stops startup here
    let config = AppConfig::from_env().map_err(|e| {
        error!(error = %e, "Configuration error");
        e
    })?;
    config.validate().map_err(|e| {
        error!(error = %e, "Configuration validation failed");
        e
    })?;
    info!(gateway = ?config.gateway, "Gateway configuration loaded");

    let (records, orders, db_pool): (
        Arc<dyn PaymentRecordStore>,
        Arc<dyn OrderCollaborator>,
        Option<sqlx::PgPool>,
    ) = if config.server.skip_externals {
        warn!("SKIP_EXTERNALS=true: using in-memory payment records and orders");
        (
            Arc::new(InMemoryPaymentRecordStore::new()),
            Arc::new(InMemoryOrderDirectory::new()),
            None,
        )
    } else {
        let pool = init_pool_from_config(&config.database).await.map_err(|e| {
            error!("Failed to initialize database pool: {}", e);
            e
        })?;
        run_migrations(&pool).await?;
        info!(
            max_connections = pool.options().get_max_connections(),
            "Database connection pool initialized"
        );
        (
            Arc::new(PgPaymentRecordRepository::new(pool.clone())),
            Arc::new(PgOrderDirectory::new(pool.clone())),
            Some(pool),
        )
    };

    let payments = PaymentsState::new(Arc::new(config.gateway.clone()), records, orders)?;
    let app = api::router(payments, HealthChecker::new(db_pool));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to address {}: {}", addr, e);
        e
    })?;

    info!(address = %addr, "Server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server shutdown complete");
    Ok(())
}
