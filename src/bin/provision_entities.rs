//! Provision Entities - create a device and a test session for a telemetry run
//!
//! Configuration is loaded from environment variables:
//!
//! - `PROVISION_CLI_PATH`: Device-management CLI (default: ../apps/cli/cli)
//! - `PROVISION_DEVICE_NAME`: Device name (default: Test Device)
//! - `PROVISION_SESSION_NAME`: Test session name (default: Test Test Session)
//! - `RUST_LOG`: Logging level filter (default: info)

use tracing::{error, info};

use telemetry_tools::config::ProvisionConfig;
use telemetry_tools::init_tracing;
use telemetry_tools::provision::{Provisioner, ProvisioningError};

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match ProvisionConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let provisioner = Provisioner::system(config.cli_path.clone());
    match provisioner
        .provision(&config.device_name, &config.session_name)
        .await
    {
        Ok(provisioned) => {
            info!(
                device_id = provisioned.device.id,
                test_session_id = provisioned.test_session.id,
                "Provisioning complete"
            );
            // Machine-readable summary for scripts
            println!(
                "{}",
                serde_json::json!({
                    "device_id": provisioned.device.id,
                    "test_session_id": provisioned.test_session.id,
                })
            );
        }
        Err(ProvisioningError::CommandFailed { command, code, stderr }) => {
            error!(command = %command, code = ?code, "Provisioning command failed");
            eprintln!("{}", stderr.trim_end());
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "Provisioning failed");
            std::process::exit(1);
        }
    }
}
