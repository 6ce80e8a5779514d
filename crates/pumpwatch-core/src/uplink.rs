use async_trait::async_trait;
use thiserror::Error;

use crate::classify::DerivedStatus;
use crate::snapshot::CorrectedSnapshot;

#[derive(Debug, Error)]
pub enum UplinkError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server rejected upload: {0}")]
    Rejected(reqwest::StatusCode),
}

/// One cloud sink. Sinks are independent: the gateway catches and logs
/// each sink's errors without letting them affect the others or the
/// rescheduling step.
#[async_trait]
pub trait UploadSink: Send {
    fn name(&self) -> &'static str;

    /// Forward one corrected snapshot and its derived attributes.
    async fn push(
        &mut self,
        snapshot: &CorrectedSnapshot,
        derived: &DerivedStatus,
    ) -> Result<(), UplinkError>;

    /// Called instead of `push` when a cycle produced no data.
    async fn push_outage(&mut self) -> Result<(), UplinkError>;

    /// Best-effort cleanup at daemon shutdown.
    async fn shutdown(&mut self) {}
}
