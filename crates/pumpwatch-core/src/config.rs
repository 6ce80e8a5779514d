use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

/// Bound used for thresholds configured as 0 ("disabled"): no sensor
/// reading ever exceeds it.
const THRESHOLD_DISABLED: u16 = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlynkConfig {
    pub server: String,
    pub token: String,
    pub heartbeat: u64,
}

impl BlynkConfig {
    pub fn enabled(&self) -> bool {
        !self.server.is_empty() && !self.token.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NightscoutConfig {
    pub server: String,
    pub api_secret: String,
}

impl NightscoutConfig {
    pub fn enabled(&self) -> bool {
        !self.server.is_empty() && !self.api_secret.is_empty()
    }
}

/// Operator-configured glucose alert bounds, immutable after load.
#[derive(Debug, Clone, Copy)]
pub struct AlertThresholds {
    pub low: u16,
    pub pre_low: u16,
    pub pre_high: u16,
    pub high: u16,
}

#[derive(Debug, Clone, Deserialize)]
struct BglSection {
    bgl_low: u16,
    bgl_pre_low: u16,
    bgl_pre_high: u16,
    bgl_high: u16,
}

#[derive(Debug, Clone, Deserialize)]
struct ConfigFile {
    blynk: BlynkConfig,
    nightscout: NightscoutConfig,
    bgl: BglSection,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub blynk: BlynkConfig,
    pub nightscout: NightscoutConfig,
    pub thresholds: AlertThresholds,
}

impl GatewayConfig {
    /// Loads and validates the TOML config file. A missing file, a missing
    /// key, or a malformed value is fatal; the daemon must not enter its
    /// loop without a complete configuration.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file: ConfigFile = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::from_file(file))
    }

    fn from_file(file: ConfigFile) -> Self {
        let upper_or_disabled = |v: u16| if v == 0 { THRESHOLD_DISABLED } else { v };
        Self {
            blynk: file.blynk,
            nightscout: file.nightscout,
            thresholds: AlertThresholds {
                low: file.bgl.bgl_low,
                pre_low: file.bgl.bgl_pre_low,
                pre_high: upper_or_disabled(file.bgl.bgl_pre_high),
                high: upper_or_disabled(file.bgl.bgl_high),
            },
        }
    }

    pub fn log_summary(&self) {
        info!(
            server = %self.blynk.server,
            heartbeat = self.blynk.heartbeat,
            token_set = !self.blynk.token.is_empty(),
            enabled = self.blynk.enabled(),
            "blynk uplink"
        );
        info!(
            server = %self.nightscout.server,
            secret_set = !self.nightscout.api_secret.is_empty(),
            enabled = self.nightscout.enabled(),
            "nightscout uplink"
        );
        info!(
            low = self.thresholds.low,
            pre_low = self.thresholds.pre_low,
            pre_high = self.thresholds.pre_high,
            high = self.thresholds.high,
            "bgl thresholds"
        );
    }
}

/// Fixed cadence parameters of the fetch cycle.
#[derive(Debug, Clone, Copy)]
pub struct CycleTiming {
    /// Expected gap between sensor readings.
    pub update_interval: Duration,
    /// Reschedule delay after a cycle that produced no data.
    pub retry_interval: Duration,
    /// Pause between fetch attempts within a cycle.
    pub retry_delay: Duration,
    /// Fetch attempts per cycle before giving up.
    pub max_retries: u32,
    /// Upper bound on one bridge invocation.
    pub fetch_timeout: Duration,
}

impl Default for CycleTiming {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(300),
            retry_interval: Duration::from_secs(180),
            retry_delay: Duration::from_secs(5),
            max_retries: 3,
            fetch_timeout: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        [blynk]
        server = "blynk.example.net"
        token = "tok"
        heartbeat = 30

        [nightscout]
        server = "https://ns.example.net"
        api_secret = "secret"

        [bgl]
        bgl_low = 70
        bgl_pre_low = 80
        bgl_pre_high = 180
        bgl_high = 250
    "#;

    #[test]
    fn full_config_parses() {
        let file: ConfigFile = toml::from_str(FULL).expect("parse");
        let config = GatewayConfig::from_file(file);
        assert!(config.blynk.enabled());
        assert!(config.nightscout.enabled());
        assert_eq!(config.thresholds.low, 70);
        assert_eq!(config.thresholds.high, 250);
    }

    #[test]
    fn zero_upper_bounds_become_unreachable() {
        let toml_str = FULL
            .replace("bgl_pre_high = 180", "bgl_pre_high = 0")
            .replace("bgl_high = 250", "bgl_high = 0");
        let file: ConfigFile = toml::from_str(&toml_str).expect("parse");
        let config = GatewayConfig::from_file(file);
        assert_eq!(config.thresholds.pre_high, 1000);
        assert_eq!(config.thresholds.high, 1000);
    }

    #[test]
    fn empty_server_disables_adapter() {
        let toml_str = FULL.replace("server = \"blynk.example.net\"", "server = \"\"");
        let file: ConfigFile = toml::from_str(&toml_str).expect("parse");
        let config = GatewayConfig::from_file(file);
        assert!(!config.blynk.enabled());
        assert!(config.nightscout.enabled());
    }

    #[test]
    fn missing_option_is_an_error() {
        let toml_str = FULL.replace("token = \"tok\"", "");
        assert!(toml::from_str::<ConfigFile>(&toml_str).is_err());
    }
}
