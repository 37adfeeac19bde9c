//! Telemetry Tools Library
//!
//! Components for feeding a device-telemetry pipeline with synthetic data:
//!
//! - **config**: Environment-based configuration for the three binaries
//! - **telemetry**: Sample windows, the wire message and the window generator
//! - **connection**: MQTT session lifecycle and readiness
//! - **backlog**: Bounded payload queue used while the broker is away
//! - **publisher**: Periodic publish loop
//! - **export**: Processed-samples snapshot to Parquet
//! - **provision**: Device and test-session creation through the management CLI
//!
//! # Example
//!
//! ```no_run
//! use telemetry_tools::config::Config;
//! use telemetry_tools::connection::ConnectionManager;
//! use telemetry_tools::publisher::TelemetryPublisher;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Load configuration from environment
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     // Prepare the broker session and drive it in the background
//!     let connection = ConnectionManager::new(config.client_id.clone());
//!     let (client, event_loop) = connection
//!         .connect(&config.broker_host, config.broker_port, config.keepalive_secs)
//!         .expect("Invalid broker settings");
//!     let network = connection.run_network_loop(event_loop, CancellationToken::new());
//!
//!     // Publish until cancelled
//!     let mut publisher = TelemetryPublisher::new(&config, connection, client);
//!     publisher.run(CancellationToken::new()).await.ok();
//!     network.abort();
//! }
//! ```

use tracing_subscriber::EnvFilter;

// Module declarations
pub mod backlog;
pub mod config;
pub mod connection;
pub mod export;
pub mod provision;
pub mod publisher;
pub mod telemetry;

// Re-export commonly used types at crate root for convenience
pub use backlog::{Backlog, BacklogStats};
pub use config::{Config, ConfigError, DisconnectedPolicy, ExportConfig, ProvisionConfig};
pub use connection::{ConnectionManager, ConnectionState, DisconnectReason, TransportFailure};
pub use export::{ExportError, ProcessedSample};
pub use provision::{Provisioner, ProvisioningError};
pub use publisher::{CycleOutcome, PublishError, PublisherError, PublisherStats, TelemetryPublisher, TelemetrySink};
pub use telemetry::{Channel, GeneratorConfig, SampleCursor, TelemetryMessage, WindowGenerator};

/// Initialize the tracing subscriber with environment-based filtering.
///
/// Honors `RUST_LOG`, falling back to `info`. Call once per process.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}
