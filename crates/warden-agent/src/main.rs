//! Warden agent binary - composition root.
//!
//! Ties the Warden crates into a single executable:
//! 1. Resolve configuration (CLI > env > TOML file > defaults)
//! 2. Build the delivery client and log whether the collector is reachable
//! 3. Open the event buffer, recovering events left by a previous run
//! 4. Start the buffer flush loop and the activity tracker
//! 5. On Ctrl-C / SIGTERM: close the open activity segment, then give the
//!    buffer one bounded chance to deliver or persist what it holds

mod cli;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use warden_activity::{ActivityTracker, BufferedSink, TrackerConfig, WindowsProbe};
use warden_buffer::{EventBuffer, EventBufferConfig};
use warden_core::config::WardenConfig;
use warden_delivery::{DeliveryClient, DeliveryConfig};

use cli::CliArgs;

const PING_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Wait for Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn ping_collector(client: &DeliveryClient, cancel: &CancellationToken) {
    match tokio::time::timeout(PING_TIMEOUT, client.ping(cancel)).await {
        Ok(Ok(())) => info!(url = %client.config().server_url, "Collector reachable"),
        Ok(Err(e)) => warn!(
            url = %client.config().server_url,
            error = %e,
            "Collector not reachable, events will be buffered"
        ),
        Err(_) => warn!(
            url = %client.config().server_url,
            timeout_secs = PING_TIMEOUT.as_secs(),
            "Collector ping timed out, events will be buffered"
        ),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let mut config = WardenConfig::load_or_default(&config_file);
    args.apply_overrides(&mut config);

    // Tracing.
    let filter = args.resolve_log_filter(&config.general.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&filter)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Warden agent v{}", env!("CARGO_PKG_VERSION"));
    if config_file.exists() {
        info!(path = %config_file.display(), "Configuration loaded");
    } else {
        info!(path = %config_file.display(), "No configuration file, using defaults");
    }

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(e.into());
    }

    let data_dir = config.data_dir();
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }

    let computer_name = config.computer_name();
    let root = CancellationToken::new();

    // Delivery.
    let client = Arc::new(DeliveryClient::new(DeliveryConfig::from(&config.server))?);
    ping_collector(&client, &root).await;

    // Buffer.
    let buffer = Arc::new(
        EventBuffer::new(EventBufferConfig::from_config(&config), Arc::clone(&client))?
            .with_span(tracing::info_span!("event_buffer", computer = %computer_name)),
    );
    info!(
        events = buffer.size(),
        path = %buffer.snapshot_path().display(),
        "Event buffer ready"
    );

    // The buffer outlives the producers, so it gets its own token.
    let buffer_task = {
        let buffer = Arc::clone(&buffer);
        let cancel = CancellationToken::new();
        tokio::spawn(async move { buffer.start(cancel).await })
    };

    // Activity tracker.
    let tracker = if !config.activity.enabled {
        info!("Activity tracking disabled in config");
        None
    } else if cfg!(target_os = "windows") {
        let tracker = ActivityTracker::new(
            TrackerConfig::from_config(&config),
            WindowsProbe::new(),
            BufferedSink::new(Arc::clone(&buffer)),
        )
        .with_span(tracing::info_span!("activity", computer = %computer_name));
        Some(Arc::new(tracker))
    } else {
        info!("Activity tracking requires Windows, skipping on this platform");
        None
    };

    let tracker_task = tracker.as_ref().map(|tracker| {
        let tracker = Arc::clone(tracker);
        let cancel = root.clone();
        tokio::spawn(async move { tracker.start(cancel).await })
    });

    info!("Warden agent running");
    shutdown_signal().await;
    info!("Shutdown signal received");

    let shutdown = async {
        // Producers first, so the last segment is part of the final flush.
        if let Some(tracker) = &tracker {
            tracker.stop().await;
        }
        root.cancel();
        if let Some(task) = tracker_task {
            if let Err(e) = task.await {
                warn!(error = %e, "Activity tracker task failed");
            }
        }

        buffer.stop();
        if let Err(e) = buffer_task.await {
            warn!(error = %e, "Event buffer task failed");
        }
    };

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown).await.is_err() {
        warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            pending = buffer.size(),
            "Shutdown timed out"
        );
    }

    info!("Warden agent stopped");
    Ok(())
}
