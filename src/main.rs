//! wpsmon - Quality-of-service monitor for OGC Web Processing Services
//!
//! Periodically sends test requests to WPS processes, records response time
//! and availability, and pauses processes that keep failing.

mod config;
mod db;
mod events;
mod measurement;
mod monitor;
mod probe;
mod qos;
mod scheduler;
#[cfg(test)]
mod test_support;
mod web;

use config::ServerConfig;
use db::Store;
use events::{EventKind, MonitorEvent};
use monitor::{MonitorControl, MonitorSettings};
use probe::ProbeClient;
use scheduler::Scheduler;
use web::Server;

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("wpsmon=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting wpsmon on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let client = ProbeClient::new(cfg.probe_timeout)?.with_jitter(Duration::from_millis(100));
    tracing::info!("Probe timeout {:?}, failure threshold {}", client.timeout(), cfg.max_errors);
    let scheduler = Scheduler::new(cfg.worker_pool_size);
    let monitor = MonitorControl::new(store, scheduler, client, MonitorSettings::from(&cfg));

    monitor.events().subscribe(EventKind::ProcessEnteredError, |event| {
        if let MonitorEvent::ProcessEnteredError(process) = event {
            tracing::error!(
                "Process {} of service {} is in error, monitoring paused until resumed",
                process.identifier,
                process.service_id
            );
        }
    });

    monitor
        .events()
        .subscribe_named("monitor.shutdown", |_| {
            tracing::info!("Monitor shutting down, waiting for running measurements");
        })?;

    monitor.start()?;

    // Serve until Ctrl-C
    let server = Server::new(cfg, monitor.clone());
    server
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
            tracing::info!("Shutdown requested");
        })
        .await?;

    monitor.shutdown().await;
    Ok(())
}
