use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use sqlx::migrate::Migrator;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use payrail::channel::{AggregatorAdapter, CardDirectAdapter, ChannelAdapter, ChannelRegistry};
use payrail::cli::{self, Cli, Commands, ConfigCommands, DbCommands};
use payrail::config::Config;
use payrail::ledger::{create_pool, PostgresLedger};
use payrail::orders::HttpOrderGateway;
use payrail::services::{PaymentOrchestrator, WebhookDispatcher};
use payrail::{create_app, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Db(DbCommands::Migrate) => cli::handle_db_migrate(&config).await,
        Commands::Config(ConfigCommands::Check) => cli::handle_config_validate(&config),
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    // Database pool
    let pool = create_pool(&config.database_url, config.database_max_connections).await?;

    // Run migrations
    let migrator = Migrator::new(Path::new("./migrations")).await?;
    migrator.run(&pool).await?;
    tracing::info!("Database migrations completed");

    // Wire up channels, ledger and collaborators
    let registry = Arc::new(ChannelRegistry::new(vec![
        Arc::new(CardDirectAdapter::new(config.card.clone())) as Arc<dyn ChannelAdapter>,
        Arc::new(AggregatorAdapter::new(config.aggregator.clone())),
    ]));
    tracing::info!("Payment channels registered: {:?}", registry.channels());

    let ledger = Arc::new(PostgresLedger::new(pool));
    let orders = Arc::new(HttpOrderGateway::new(config.order_service_url.clone()));
    let orchestrator = Arc::new(PaymentOrchestrator::new(
        ledger.clone(),
        registry.clone(),
        orders.clone(),
    ));
    let dispatcher = Arc::new(WebhookDispatcher::new(
        ledger.clone(),
        registry.clone(),
        orders,
    ));

    let state = AppState {
        orchestrator,
        dispatcher,
        ledger,
        registry,
    };
    let app = create_app(state);

    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port).parse()?;
    tracing::info!("Payment engine listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received, draining connections");
}
