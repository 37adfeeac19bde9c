//! Telemetry Publisher - synthetic device telemetry over MQTT
//!
//! This service connects to an MQTT broker, waits for the session to come
//! up, and then publishes one sample window per interval on
//! `device/<device_id>/raw`.
//!
//! ## Features
//!
//! - Async publish loop using tokio runtime
//! - Automatic reconnection with readiness tracking
//! - Configurable handling of cycles that fall in a disconnected period
//! - Graceful shutdown on SIGINT
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `TELEMETRY_BROKER_HOST`: Broker host (default: localhost)
//! - `TELEMETRY_BROKER_PORT`: Broker port (default: 1884)
//! - `TELEMETRY_DEVICE_ID`: Device identifier (default: 1)
//! - `TELEMETRY_SCENARIO_ID`: Scenario identifier (default: 19)
//! - `TELEMETRY_WINDOW_SIZE`: Samples per window (default: 50)
//! - `TELEMETRY_PUBLISH_INTERVAL_MS`: Milliseconds between messages (default: 100)
//! - `TELEMETRY_DISCONNECTED_POLICY`: drop, buffer or block (default: drop)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use telemetry_tools::config::Config;
use telemetry_tools::connection::ConnectionManager;
use telemetry_tools::init_tracing;
use telemetry_tools::publisher::{PublisherError, TelemetryPublisher};

/// How long to wait for the network loop to flush DISCONNECT on shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Exit code when the broker never became ready
const EXIT_NOT_READY: i32 = 2;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting Telemetry Publisher...");

    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                broker = %format!("{}:{}", config.broker_host, config.broker_port),
                topic = %config.topic(),
                window_size = config.window_size,
                interval_ms = config.publish_interval.as_millis() as u64,
                policy = %config.disconnected_policy,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    // Prepare the broker session
    let connection = ConnectionManager::new(config.client_id.clone());
    let (client, event_loop) =
        match connection.connect(&config.broker_host, config.broker_port, config.keepalive_secs) {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "Invalid broker settings");
                std::process::exit(1);
            }
        };

    // The network loop outlives the publisher so DISCONNECT can be flushed
    let network_cancel = CancellationToken::new();
    let network_handle = connection.run_network_loop(event_loop, network_cancel.clone());

    // Spawn publisher task
    let shutdown = CancellationToken::new();
    let mut publisher = TelemetryPublisher::new(&config, connection.clone(), client.clone());
    let publisher_shutdown = shutdown.clone();
    let mut publisher_handle = tokio::spawn(async move {
        info!("Publisher task started");
        let result = publisher.run(publisher_shutdown).await;
        info!("Publisher task completed");
        result
    });

    // Wait for shutdown signal or an early publisher exit
    info!("Telemetry Publisher running. Press Ctrl+C to stop.");
    let finished_early = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Shutdown signal received, stopping..."),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
            None
        }
        result = &mut publisher_handle => Some(result),
    };

    // Graceful shutdown
    info!("Initiating graceful shutdown...");
    shutdown.cancel();

    let result = match finished_early {
        Some(result) => result,
        None => publisher_handle.await,
    };

    let mut exit_code = 0;
    match result {
        Ok(Ok(stats)) => {
            info!(
                messages_published = stats.messages_published,
                messages_dropped = stats.messages_dropped,
                messages_buffered = stats.messages_buffered,
                samples_generated = stats.samples_generated,
                publish_errors = stats.publish_errors,
                "Publisher statistics"
            );
        }
        Ok(Err(e @ PublisherError::NotReady { .. })) => {
            error!(error = %e, "Publisher gave up");
            exit_code = EXIT_NOT_READY;
        }
        Err(e) => {
            warn!(error = %e, "Publisher task panicked during shutdown");
            exit_code = 1;
        }
    }

    // Close the session and let the loop finish
    connection
        .shutdown(&client, network_handle, &network_cancel, SHUTDOWN_TIMEOUT)
        .await;

    info!("Telemetry Publisher stopped");
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}
