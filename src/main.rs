mod main_runtime;

use clap::Parser;
use config::ConfigError;
use manman::adapters::{AmqpBroker, PostgresStore};
use manman::api::{create_router, AppState};
use manman::cli::{Cli, Commands};
use manman::config::AppConfig;
use manman::error::Result;
use manman::services::{validate_protocol, CommandPublisher, PortAllocator, SessionHandler};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use main_runtime::{init_logging, init_logging_simple, shutdown_signal};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;
    if let Err(errors) = config.validate() {
        return Err(ConfigError::Message(errors.join("; ")).into());
    }

    match cli.command_or_default() {
        Commands::Serve {
            port,
            skip_migrations,
        } => {
            let _log_guard = init_logging(&config.logging);
            run_serve(config, port, skip_migrations).await?;
        }
        Commands::Migrate => {
            init_logging_simple();
            let store =
                PostgresStore::new(&config.database.url, config.database.max_connections).await?;
            store.migrate().await?;
            println!("Migrations applied");
        }
        Commands::AvailablePorts {
            server_id,
            start,
            end,
            protocol,
        } => {
            init_logging_simple();
            let protocol = validate_protocol(&protocol)?;
            let store =
                PostgresStore::new(&config.database.url, config.database.max_connections).await?;
            let allocator = PortAllocator::new(Arc::new(store));
            let ports = allocator
                .get_available_ports_in_range(server_id, start, end, protocol)
                .await?;

            println!(
                "{} of {} {} ports free on server {}",
                ports.len(),
                end.saturating_sub(start) + 1,
                protocol,
                server_id
            );
            for port in ports {
                println!("  {}", port);
            }
        }
    }

    Ok(())
}

async fn run_serve(config: AppConfig, port: Option<u16>, skip_migrations: bool) -> Result<()> {
    info!("Starting manman control plane");

    let store = Arc::new(
        PostgresStore::new(&config.database.url, config.database.max_connections).await?,
    );
    if skip_migrations {
        warn!("Skipping database migrations");
    } else {
        store.migrate().await?;
    }

    let broker = Arc::new(
        AmqpBroker::connect(
            &config.broker.url,
            &config.broker.exchange,
            &config.broker.reply_queue_prefix,
        )
        .await?,
    );

    let shutdown = CancellationToken::new();
    let publisher =
        CommandPublisher::start(broker.clone(), config.broker.exchange.clone(), shutdown.clone())
            .await?;
    let handler = Arc::new(SessionHandler::new(
        store.clone(),
        store.clone(),
        store.clone(),
        publisher.clone(),
        config.rpc_timeouts(),
    ));

    let app = create_router(AppState::new(handler, shutdown.clone()));
    let addr = SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(config.api.port)));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API listening on {}", addr);

    let token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Received shutdown signal");
            token.cancel();
        })
        .await?;

    publisher.shutdown().await;
    if let Err(e) = broker.close().await {
        warn!("Broker close failed: {}", e);
    }
    store.pool().close().await;
    info!("Shutdown complete");
    Ok(())
}
