//! # Webhooks Service Entry Point
//!
//! `serve` runs the API together with the delivery worker pool, `worker` runs
//! only the pool and `migrate` applies pending migrations and exits.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use webhooks::{
    clock::{Clock, SystemClock},
    config::{AppConfig, ConfigLoader},
    db,
    server::{AppState, run_server},
    telemetry,
    transport::ReqwestTransport,
    worker::{DeliveryWorker, DeliveryWorkerPool},
};

#[derive(Debug, Parser)]
#[command(name = "webhooks", version, about = "Webhook subscriptions and signed delivery")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the API and run delivery workers (default)
    Serve {
        /// Do not start the delivery worker pool in this process
        #[arg(long)]
        no_workers: bool,
        /// Do not apply pending migrations on startup
        #[arg(long)]
        skip_migrations: bool,
    },
    /// Run only the delivery worker pool
    Worker,
    /// Apply pending database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing telemetry")?;

    tracing::info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, "Effective configuration");
    }

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;

    let command = cli.command.unwrap_or(Command::Serve {
        no_workers: false,
        skip_migrations: false,
    });

    match command {
        Command::Migrate => {
            db::migrate(&db).await?;
            tracing::info!("Migrations applied");
            Ok(())
        }
        Command::Worker => {
            let shutdown = shutdown_on_ctrl_c();
            let clock: Arc<dyn Clock> = Arc::new(SystemClock);
            let handles = start_workers(&config, db, clock, shutdown.clone())?;
            shutdown.cancelled().await;
            join_workers(handles).await;
            Ok(())
        }
        Command::Serve {
            no_workers,
            skip_migrations,
        } => {
            if !skip_migrations {
                db::migrate(&db).await?;
            }

            let shutdown = shutdown_on_ctrl_c();
            let clock: Arc<dyn Clock> = Arc::new(SystemClock);
            let workers = if no_workers {
                Vec::new()
            } else {
                start_workers(&config, db.clone(), Arc::clone(&clock), shutdown.clone())?
            };

            let state = AppState::new(Arc::new(config), db, clock);
            let served = run_server(state, shutdown.clone()).await;

            shutdown.cancel();
            join_workers(workers).await;
            served
        }
    }
}

fn start_workers(
    config: &AppConfig,
    db: sea_orm::DatabaseConnection,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
) -> Result<Vec<tokio::task::JoinHandle<()>>> {
    let transport = ReqwestTransport::new(config.delivery.request_timeout())
        .context("building webhook HTTP client")?;
    let worker = DeliveryWorker::new(db, Arc::new(transport), clock, &config.delivery);
    Ok(DeliveryWorkerPool::new(worker, config.delivery.clone()).spawn(shutdown))
}

async fn join_workers(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "Delivery worker task ended abnormally");
        }
    }
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutdown signal received");
        trigger.cancel();
    });
    shutdown
}
