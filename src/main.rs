//! Strait swapd - control-plane coordinator for peer-to-peer atomic swaps
//!
//! This daemon runs the swap protocol state machine for every swap it is
//! responsible for, delegating key material to walletd, chain access to
//! syncerd, counterparty traffic to peerd and decisions to supervisord.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};

mod api;
mod bus;
mod checkpoint;
mod config;
mod error;
mod metrics;
mod protocol;
mod supervisor;
mod swap;
mod syncer;
mod wallet;

use bus::ServiceBus;
use checkpoint::CheckpointStore;
use config::Settings;
use metrics::MetricsServer;
use supervisor::FundingBoard;
use swap::manager::SwapManager;
use swap::runtime::SwapServices;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Strait swapd v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Instance {} on network {}",
        settings.swapd.instance_id, settings.swapd.network
    );

    // Initialize checkpoint store
    let store = Arc::new(CheckpointStore::new(&settings.database).await?);
    info!("Checkpoint store connected");

    // Run migrations
    store.run_migrations().await?;
    info!("Database migrations complete");

    let restorable = store.list().await?;
    if !restorable.is_empty() {
        info!(
            "{} restorable checkpoint(s) on disk, waiting for supervisord",
            restorable.len()
        );
    }

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Dial the collaborator daemons
    let (service_bus, channels) =
        ServiceBus::connect(&settings.services, bus::DEFAULT_QUEUE_DEPTH);
    info!("Collaborator links dialing");

    // Notices pass through the funding board on their way out so the API
    // can answer funding queries locally.
    let funding = Arc::new(FundingBoard::new());
    let (notice_tx, mut notice_rx) = mpsc::channel(bus::DEFAULT_QUEUE_DEPTH);
    let forwarder_handle = tokio::spawn({
        let board = funding.clone();
        let out = channels.notice_tx.clone();
        async move {
            while let Some(notice) = notice_rx.recv().await {
                board.observe(&notice);
                if out.send(notice).await.is_err() {
                    break;
                }
            }
        }
    });

    // Initialize the swap manager
    let (done_tx, done_rx) = mpsc::channel(bus::DEFAULT_QUEUE_DEPTH);
    let services = SwapServices {
        wallet: channels.wallet.clone(),
        store: store.clone(),
        syncer_tx: channels.syncer_tx.clone(),
        peer_tx: channels.peer_tx.clone(),
        notice_tx,
        done_tx,
        config: settings.swap.clone(),
    };
    let manager = Arc::new(SwapManager::new(services));
    info!("Swap manager initialized");

    let reaper_handle = tokio::spawn(manager.clone().run_reaper(done_rx));

    // Attach inbound bus traffic to the manager
    let bus_handles = service_bus.serve(manager.clone());

    // Start API server
    let api_handle = tokio::spawn(api::run_server(
        settings.api.clone(),
        manager.clone(),
        store.clone(),
        funding.clone(),
        settings.swapd.clone(),
    ));

    // Start metrics server
    let metrics_handle = metrics_server
        .map(|server| tokio::spawn(async move { server.run().await }));

    // Health check loop
    let health_handle = tokio::spawn({
        let store = store.clone();
        let interval = settings.swapd.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                match store.health_check().await {
                    Ok(()) => metrics::record_health_check(),
                    Err(e) => {
                        warn!("Checkpoint store health check failed: {}", e);
                        metrics::record_health_check_failure();
                    }
                }
            }
        }
    });

    info!("Strait swapd is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown: close the swap mailboxes and wait for the tasks to
    // drain before dropping the bus.
    manager.shutdown().await;

    api_handle.abort();
    health_handle.abort();
    forwarder_handle.abort();
    reaper_handle.abort();
    for handle in bus_handles {
        handle.abort();
    }
    if let Some(handle) = metrics_handle {
        handle.abort();
    }

    info!("Strait swapd stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,strait_swapd=debug,sqlx=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
