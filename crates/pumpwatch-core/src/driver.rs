use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::snapshot::Snapshot;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("bridge command failed to start: {0}")]
    Spawn(String),
    #[error("bridge exited with status {status}: {stderr}")]
    BridgeFailed { status: i32, stderr: String },
    #[error("bridge produced unreadable output: {0}")]
    Decode(String),
    #[error("timeout")]
    Timeout,
}

/// The device-driver collaborator: one operation, fetch the current
/// telemetry snapshot or fail. Protocol decoding lives entirely behind
/// this seam.
#[async_trait]
pub trait TelemetrySource: Send {
    async fn fetch_snapshot(&mut self) -> Result<Snapshot, DriverError>;
}

/// Production source: invokes the external CNL radio-bridge command and
/// parses the single JSON snapshot it prints to stdout.
pub struct CnlBridgeSource {
    command: String,
    args: Vec<String>,
}

impl CnlBridgeSource {
    pub fn new(command_line: &str) -> Self {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let command = parts.next().unwrap_or_else(|| "cnl24-bridge".to_string());
        Self {
            command,
            args: parts.collect(),
        }
    }
}

#[async_trait]
impl TelemetrySource for CnlBridgeSource {
    async fn fetch_snapshot(&mut self) -> Result<Snapshot, DriverError> {
        debug!(command = %self.command, "invoking radio bridge");
        let output = Command::new(&self.command)
            .args(&self.args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| DriverError::Spawn(err.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(DriverError::BridgeFailed {
                status: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|err| DriverError::Decode(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_splits_into_program_and_args() {
        let source = CnlBridgeSource::new("cnl24-bridge --serial /dev/ttyACM0");
        assert_eq!(source.command, "cnl24-bridge");
        assert_eq!(source.args, vec!["--serial", "/dev/ttyACM0"]);
    }

    #[tokio::test]
    async fn failing_bridge_reports_stderr() {
        let mut source = CnlBridgeSource::new("sh -c ./definitely-missing-bridge");
        let err = source.fetch_snapshot().await.expect_err("must fail");
        match err {
            DriverError::BridgeFailed { status, .. } => assert_ne!(status, 0),
            DriverError::Spawn(_) => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
