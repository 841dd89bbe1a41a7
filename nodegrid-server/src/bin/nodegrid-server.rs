//! Thin wrapper binary that boots one nodegrid process: load config,
//! initialize tracing, connect the durable stores, create the `main`
//! node, and drive it until a shutdown signal arrives. Grounded
//! directly on
//! `examples/tasker-systems-tasker-core/tasker-orchestration/src/bin/server.rs`
//! (structure, log lines, `tokio::select!` signal handling, shutdown
//! timeout pattern) — only the bootstrapped subsystem differs.

use clap::Parser;
use nodegrid_address::Address;
use nodegrid_jobs::{JobStore, PgJobStore, SafeRootList};
use nodegrid_pqueue::{PersistentQueueStore, PgPersistentQueueStore, QueueConfig};
use nodegrid_server::{CompactServer, NodeFactory};
use nodegrid_shared::{logging, NodegridConfig};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "nodegrid-server", about = "Nodegrid distributed message-passing runtime")]
struct Args {
    /// Path prefix for layered config files (unused beyond documenting
    /// intent; NodegridConfig::load() reads `config/nodegrid/*` and
    /// `NODEGRID_ENV`/`NODEGRID__*` regardless of this flag).
    #[arg(long)]
    config: Option<String>,

    /// Node name to run (spec §4.9 "named schedulers").
    #[arg(long, default_value = "main")]
    node_name: String,

    /// Graceful shutdown timeout in milliseconds.
    #[arg(long, default_value_t = 30_000)]
    shutdown_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_tracing();

    let args = Args::parse();

    info!("Starting Nodegrid Server...");
    info!("   Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        "   Build Mode: {}",
        if cfg!(debug_assertions) { "Debug" } else { "Release" }
    );

    let config = NodegridConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_millis(config.database.connect_timeout_ms))
        .connect(&config.database.url)
        .await
        .map_err(|e| format!("Failed to connect to database: {e}"))?;

    let pqueue_store: Arc<dyn PersistentQueueStore> = Arc::new(PgPersistentQueueStore::new(pool.clone()));
    let job_store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool));

    let factory = NodeFactory::new(
        pqueue_store,
        job_store,
        QueueConfig::default(),
        SafeRootList::new(config.jobs.safe_roots.clone()),
    )
    .with_sweep_intervals(
        Duration::from_millis(config.pqueue.status_check_delay_ms),
        Duration::from_millis(config.jobs.timeout_check_delay_ms),
    );

    let own_address = Address::raw(args.node_name.clone());
    let node = factory.create_node(own_address, args.node_name.clone());

    let mut server = CompactServer::new(config.scheduler.clone());
    server.add_node(args.node_name.clone(), node);

    info!(node = %args.node_name, "Nodegrid Server started successfully!");
    info!("   Press Ctrl+C to shutdown gracefully");

    tokio::select! {
        _ = run_forever(&mut server) => {}
        _ = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
        }
    }

    server.request_stop();
    match tokio::time::timeout(
        Duration::from_millis(args.shutdown_timeout_ms),
        server.run_until_stopped(),
    )
    .await
    {
        Ok(Ok(())) => info!("Nodegrid Server stopped"),
        Ok(Err(e)) => error!("Failed to stop cleanly: {e}"),
        Err(_) => error!(
            timeout_ms = args.shutdown_timeout_ms,
            "Graceful shutdown timed out, forcing exit"
        ),
    }

    info!("Nodegrid Server shutdown complete");
    Ok(())
}

async fn run_forever(server: &mut CompactServer) {
    loop {
        if let Err(e) = server.yield_wait().await {
            error!("scheduler step failed: {e}");
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("Received Ctrl+C"); },
        _ = terminate => { info!("Received SIGTERM"); },
    }
}
