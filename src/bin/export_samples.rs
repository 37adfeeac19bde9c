//! Export Samples - one-shot snapshot of `processed_samples` to Parquet
//!
//! Configuration is loaded from environment variables:
//!
//! - `EXPORT_DATABASE_URL`: Postgres connection URI
//! - `EXPORT_OUTPUT_PATH`: Destination file (default: data.parquet)
//! - `RUST_LOG`: Logging level filter (default: info)

use tracing::{error, info};

use telemetry_tools::config::ExportConfig;
use telemetry_tools::export::run_export;
use telemetry_tools::init_tracing;

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match ExportConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    match run_export(&config).await {
        Ok(rows) => {
            info!(rows = rows, path = %config.output_path.display(), "Snapshot written");
        }
        Err(e) => {
            error!(error = %e, "Export failed");
            std::process::exit(1);
        }
    }
}
