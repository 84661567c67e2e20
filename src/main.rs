//! beacon-ctrl - beacon proximity, zone and trigger engine daemon
//!
//! Reads platform callbacks (ranging passes, region exits, location, app
//! state) as newline-delimited JSON on stdin and drives the engine. Fired
//! actions are delivered through the file backend as JSONL.
//!
//! Module structure:
//! - `domain/` - Beacons, zones, triggers, action events, registry
//! - `io/` - Collaborators (backend, platform, observer, snapshot store, feed)
//! - `services/` - Pipeline components and the Engine
//! - `infra/` - Config, metrics, errors

use beacon_ctrl::domain::types::epoch_ms;
use beacon_ctrl::infra::{Config, Metrics};
use beacon_ctrl::io::{
    read_stdin_feed, Backend, FileBackend, JsonFileStore, RecordingPlatform, TracingObserver,
};
use beacon_ctrl::services::Engine;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// beacon-ctrl - beacon proximity and trigger engine
#[derive(Parser, Debug)]
#[command(name = "beacon-ctrl", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,

    /// Ignore any saved snapshot and start from the site file
    #[arg(long)]
    fresh: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Config first: it decides the log format
    let config = Config::load_from_path(&args.config);
    init_logging(config.log_json());

    info!(git_hash = env!("GIT_HASH"), profile = env!("BUILD_PROFILE"), "beacon-ctrl starting");
    info!(
        config_file = %config.config_file(),
        client_id = %config.client_id(),
        max_monitored_regions = config.max_monitored_regions(),
        beacon_leave_delay_ms = config.beacon_leave_delay_ms(),
        zone_change_delay_ms = config.zone_change_delay_ms(),
        min_refire_interval_ms = config.min_refire_interval_ms(),
        site_file = %config.site_file(),
        events_file = %config.events_file(),
        snapshot_file = %config.snapshot_file(),
        prometheus_port = config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_shutdown = shutdown_rx.clone();
        let client = config.client_id().to_string();
        tokio::spawn(async move {
            if let Err(e) = beacon_ctrl::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                client,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "prometheus_server_error");
            }
        });
    }

    let backend: Arc<dyn Backend> = Arc::new(
        FileBackend::new(config.site_file(), config.events_file())
            .with_identity(config.client_id(), config.user_id()),
    );
    let store = JsonFileStore::new(config.snapshot_file());
    let platform = RecordingPlatform::new();

    let mut engine = Engine::new(config, Box::new(platform), Box::new(TracingObserver), metrics.clone());

    if !args.fresh {
        match engine.load_snapshot(&store) {
            Ok(true) => {}
            Ok(false) => info!("snapshot_not_found"),
            Err(e) => warn!(error = %e, code = e.error_code(), "snapshot_ignored"),
        }
    }

    // Live configuration wins over the snapshot's copy
    if let Err(e) = engine.refresh_configuration(backend.as_ref(), epoch_ms()).await {
        if engine.registry().beacon_count() == 0 {
            error!(error = %e, "no_site_configuration");
            return Err(e.into());
        }
        warn!(error = %e, "using_snapshot_configuration");
    }
    if let Err(e) = engine.sync_beacons(backend.as_ref()).await {
        warn!(error = %e, "beacon_sync_failed");
    }

    if let Err(e) = engine.start_monitoring() {
        error!(error = %e, code = e.error_code(), "monitoring_not_started");
        return Err(e.into());
    }

    // Feed: stdin JSONL -> engine
    let (input_tx, input_rx) = mpsc::channel(1000);
    let feed_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        match read_stdin_feed(input_tx, feed_shutdown).await {
            Ok(stats) => info!(forwarded = stats.forwarded, malformed = stats.malformed, "feed_closed"),
            Err(e) => error!(error = %e, "feed_error"),
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    // Run engine - consumes feed until stdin closes or shutdown
    engine.run(input_rx, backend, shutdown_rx).await;

    if let Err(e) = engine.save_snapshot(&store, epoch_ms()) {
        error!(error = %e, "snapshot_save_failed");
    }
    metrics.report().log();

    info!("beacon-ctrl shutdown complete");
    Ok(())
}
