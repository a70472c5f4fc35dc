//! netmapd daemon entry point.

use std::sync::Arc;

use log::{error, info};
use tokio::signal;
use tokio::sync::mpsc;

use netmapd::config::Config;
use netmapd::coordinator::Coordinator;
use netmapd::distribution::{run_distribution, LogSink};
use netmapd::dns_server::run_dns_server;
use netmapd::feed::{EventFeed, JsonLinesFeed};
use netmapd::mapper::Mapper;
use netmapd::snapshot::Snapshot;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting netmapd with config: {:?}", cfg);

    // Map updates flow from the coordinator to distribution
    let (update_tx, update_rx) = mpsc::unbounded_channel();
    let distribution_handle = tokio::spawn(async move {
        if let Err(e) = run_distribution(update_rx, LogSink).await {
            error!("Distribution failed: {}", e);
        }
    });

    let coordinator = Arc::new(Coordinator::new(Mapper::new(cfg.dns_settings()), update_tx));
    if let Some(ref path) = cfg.seed_file {
        let snapshot = Snapshot::load(path).await?;
        coordinator.seed(snapshot).await;
    }

    // Event channel
    let (event_tx, event_rx) = mpsc::channel(128);

    let coordinator_handle = tokio::spawn(Arc::clone(&coordinator).run(event_rx));

    // Event feed (stdin)
    let feed = JsonLinesFeed::stdin();
    let feed_handle = tokio::spawn(async move {
        if let Err(e) = feed.monitor(event_tx).await {
            error!("Event feed failed: {}", e);
        }
    });

    // DNS Server
    let dns_handle = if cfg.dns_enabled {
        let coordinator_for_dns = Arc::clone(&coordinator);
        let dns_bind = cfg.dns_bind;
        Some(tokio::spawn(async move {
            if let Err(e) = run_dns_server(dns_bind, coordinator_for_dns).await {
                error!("DNS server failed: {}", e);
            }
        }))
    } else {
        None
    };

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    // Abort tasks
    feed_handle.abort();
    coordinator_handle.abort();
    distribution_handle.abort();
    if let Some(handle) = dns_handle {
        handle.abort();
    }

    info!("Shutdown complete.");
    Ok(())
}
