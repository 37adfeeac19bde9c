//! Device and test-session provisioning through the device-management CLI.
//!
//! The CLI prints the created record as JSON on stdout. Provisioning creates
//! a device first and feeds its `ID` into the test-session command.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Captured result of one external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or `None` if the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Errors that can occur while provisioning.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("command '{command}' not found")]
    ToolNotFound { command: String },

    #[error("command '{command}' failed with exit code {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command '{command}' printed invalid JSON: {source}")]
    InvalidOutput {
        command: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Runs external programs and captures their output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &Path, args: &[String]) -> Result<CommandOutput, ProvisioningError>;
}

/// [`CommandRunner`] backed by real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &Path, args: &[String]) -> Result<CommandOutput, ProvisioningError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|source| {
                let command = command_line(program, args);
                if source.kind() == ErrorKind::NotFound {
                    ProvisioningError::ToolNotFound { command }
                } else {
                    ProvisioningError::Spawn { command, source }
                }
            })?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Device record printed by `create device`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceRecord {
    #[serde(rename = "ID")]
    pub id: u64,

    #[serde(default, alias = "Name")]
    pub name: String,
}

/// Test-session record printed by `create test-session`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TestSessionRecord {
    #[serde(rename = "ID")]
    pub id: u64,

    #[serde(default, alias = "Name")]
    pub name: String,

    #[serde(default, alias = "DeviceID")]
    pub device_id: Option<u64>,
}

/// Records created by one provisioning run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    pub device: DeviceRecord,
    pub test_session: TestSessionRecord,
}

/// Drives the CLI to create the records a telemetry run needs.
pub struct Provisioner<R> {
    cli_path: PathBuf,
    runner: R,
}

impl Provisioner<SystemCommandRunner> {
    /// Provisioner that spawns the real CLI.
    pub fn system(cli_path: impl Into<PathBuf>) -> Self {
        Self::new(cli_path, SystemCommandRunner)
    }
}

impl<R: CommandRunner> Provisioner<R> {
    pub fn new(cli_path: impl Into<PathBuf>, runner: R) -> Self {
        Self {
            cli_path: cli_path.into(),
            runner,
        }
    }

    /// `cli create device -n <name>`
    pub async fn create_device(&self, name: &str) -> Result<DeviceRecord, ProvisioningError> {
        let args = vec![
            "create".to_string(),
            "device".to_string(),
            "-n".to_string(),
            name.to_string(),
        ];
        let device: DeviceRecord = self.run_json(&args).await?;
        info!(device_id = device.id, name = %device.name, "Device created");
        Ok(device)
    }

    /// `cli create test-session -n <name> -d <device_id>`
    pub async fn create_test_session(
        &self,
        name: &str,
        device_id: u64,
    ) -> Result<TestSessionRecord, ProvisioningError> {
        let args = vec![
            "create".to_string(),
            "test-session".to_string(),
            "-n".to_string(),
            name.to_string(),
            "-d".to_string(),
            device_id.to_string(),
        ];
        let session: TestSessionRecord = self.run_json(&args).await?;
        info!(
            test_session_id = session.id,
            device_id = device_id,
            "Test session created"
        );
        Ok(session)
    }

    /// Create a device, then a test session bound to it.
    pub async fn provision(
        &self,
        device_name: &str,
        session_name: &str,
    ) -> Result<Provisioned, ProvisioningError> {
        let device = self.create_device(device_name).await?;
        let test_session = self.create_test_session(session_name, device.id).await?;
        Ok(Provisioned {
            device,
            test_session,
        })
    }

    async fn run_json<T>(&self, args: &[String]) -> Result<T, ProvisioningError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let command = command_line(&self.cli_path, args);
        debug!(command = %command, "Running provisioning command");

        let output = self.runner.run(&self.cli_path, args).await?;
        if !output.success() {
            warn!(
                command = %command,
                code = ?output.exit_code,
                stderr = %output.stderr.trim(),
                "Provisioning command failed"
            );
            return Err(ProvisioningError::CommandFailed {
                command,
                code: output.exit_code,
                stderr: output.stderr,
            });
        }

        serde_json::from_str(output.stdout.trim())
            .map_err(|source| ProvisioningError::InvalidOutput { command, source })
    }
}

fn command_line(program: &Path, args: &[String]) -> String {
    std::iter::once(program.display().to_string())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned outputs and records the argument lists it was given.
    #[derive(Default)]
    struct ScriptedRunner {
        outputs: Mutex<VecDeque<Result<CommandOutput, ProvisioningError>>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedRunner {
        fn with(outputs: Vec<Result<CommandOutput, ProvisioningError>>) -> Self {
            Self {
                outputs: Mutex::new(outputs.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, _program: &Path, args: &[String]) -> Result<CommandOutput, ProvisioningError> {
            self.calls.lock().unwrap().push(args.to_vec());
            self.outputs
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected command")
        }
    }

    fn ok(stdout: &str) -> Result<CommandOutput, ProvisioningError> {
        Ok(CommandOutput {
            exit_code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    fn failed(code: i32, stderr: &str) -> Result<CommandOutput, ProvisioningError> {
        Ok(CommandOutput {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        })
    }

    #[tokio::test]
    async fn test_provision_passes_device_id_to_session() {
        let runner = ScriptedRunner::with(vec![
            ok(r#"{"ID": 12, "name": "Test Device"}"#),
            ok(r#"{"ID": 30, "name": "Test Test Session", "device_id": 12}"#),
        ]);
        let provisioner = Provisioner::new("cli", runner);

        let provisioned = provisioner
            .provision("Test Device", "Test Test Session")
            .await
            .unwrap();

        assert_eq!(provisioned.device.id, 12);
        assert_eq!(provisioned.test_session.id, 30);
        assert_eq!(provisioned.test_session.device_id, Some(12));

        let calls = provisioner.runner.calls();
        assert_eq!(calls[0], vec!["create", "device", "-n", "Test Device"]);
        assert_eq!(
            calls[1],
            vec!["create", "test-session", "-n", "Test Test Session", "-d", "12"]
        );
    }

    #[tokio::test]
    async fn test_non_zero_exit_carries_stderr() {
        let runner = ScriptedRunner::with(vec![failed(1, "Error: HTTP 500 - database down\n")]);
        let provisioner = Provisioner::new("cli", runner);

        let err = provisioner.create_device("Test Device").await.unwrap_err();
        match err {
            ProvisioningError::CommandFailed { code, stderr, command } => {
                assert_eq!(code, Some(1));
                assert!(stderr.contains("database down"));
                assert_eq!(command, "cli create device -n Test Device");
            }
            other => panic!("expected CommandFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_device_failure_halts_sequence() {
        let runner = ScriptedRunner::with(vec![failed(2, "boom")]);
        let provisioner = Provisioner::new("cli", runner);

        assert!(provisioner.provision("d", "s").await.is_err());
        assert_eq!(provisioner.runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_json_output() {
        let runner = ScriptedRunner::with(vec![ok("Response:  {12 Test Device}")]);
        let provisioner = Provisioner::new("cli", runner);

        let err = provisioner.create_device("Test Device").await.unwrap_err();
        assert!(matches!(err, ProvisioningError::InvalidOutput { .. }));
    }

    #[tokio::test]
    async fn test_missing_tool_is_distinguished() {
        let provisioner = Provisioner::system("/nonexistent/neuro-lab-cli");

        let err = provisioner.create_device("Test Device").await.unwrap_err();
        assert!(matches!(err, ProvisioningError::ToolNotFound { .. }));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_command_output_success() {
        let output = CommandOutput {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(!output.success());
    }

    #[test]
    fn test_device_record_accepts_go_field_names() {
        let device: DeviceRecord = serde_json::from_str(r#"{"ID": 3, "Name": "Rig"}"#).unwrap();
        assert_eq!(device.id, 3);
        assert_eq!(device.name, "Rig");
    }
}
