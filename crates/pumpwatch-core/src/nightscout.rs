//! Time-series uplink: pushes each corrected snapshot to a Nightscout
//! instance as one sgv entry plus one devicestatus record.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::classify::DerivedStatus;
use crate::config::NightscoutConfig;
use crate::snapshot::CorrectedSnapshot;
use crate::uplink::{UploadSink, UplinkError};

const DEVICE_NAME: &str = "pumpwatch://minimed670g";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Nightscout direction vocabulary for the pump's trend-arrow strings.
fn direction(trend_arrow: &str) -> &'static str {
    match trend_arrow {
        "No arrows" => "Flat",
        "One arrow up" => "SingleUp",
        "Two arrows up" => "DoubleUp",
        "Three arrows up" => "TripleUp",
        "One arrow down" => "SingleDown",
        "Two arrows down" => "DoubleDown",
        "Three arrows down" => "TripleDown",
        _ => "NOT COMPUTABLE",
    }
}

pub struct NightscoutUplink {
    server: String,
    secret_digest: String,
    client: reqwest::Client,
}

impl NightscoutUplink {
    pub fn new(config: &NightscoutConfig) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(config.api_secret.as_bytes());
        Self {
            server: config.server.trim_end_matches('/').to_string(),
            secret_digest: hex::encode(hasher.finalize()),
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, endpoint: &str, payload: serde_json::Value) -> Result<(), UplinkError> {
        let url = format!("{}/api/v1/{endpoint}", self.server);
        let response = self
            .client
            .post(&url)
            .header("api-secret", &self.secret_digest)
            .timeout(REQUEST_TIMEOUT)
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(UplinkError::Rejected(response.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl UploadSink for NightscoutUplink {
    fn name(&self) -> &'static str {
        "nightscout"
    }

    async fn push(
        &mut self,
        snapshot: &CorrectedSnapshot,
        _derived: &DerivedStatus,
    ) -> Result<(), UplinkError> {
        debug!("uploading data to nightscout");

        // An exception code is not a glucose value; only the pump status
        // record is meaningful then.
        if let Some(bgl) = snapshot.sensor_bgl.value() {
            let entry = json!([{
                "type": "sgv",
                "sgv": bgl,
                "direction": direction(&snapshot.trend_arrow),
                "date": snapshot.sensor_bgl_timestamp.timestamp_millis(),
                "dateString": snapshot.sensor_bgl_timestamp.to_rfc3339(),
                "device": DEVICE_NAME,
            }]);
            self.post("entries.json", entry).await?;
        }

        let devicestatus = json!({
            "device": DEVICE_NAME,
            "created_at": snapshot.pump_time.to_rfc3339(),
            "pump": {
                "clock": snapshot.pump_time.to_rfc3339(),
                "reservoir": snapshot.insulin_units_remaining,
                "iob": { "bolusiob": snapshot.active_insulin },
                "battery": { "percent": snapshot.battery_pct },
            },
            "uploader": { "battery": snapshot.sensor_battery_pct },
        });
        self.post("devicestatus.json", devicestatus).await
    }

    async fn push_outage(&mut self) -> Result<(), UplinkError> {
        // Gaps in the time series are self-describing.
        Ok(())
    }
}
