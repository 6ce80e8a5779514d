pub mod blynk;
pub mod classify;
pub mod codes;
pub mod config;
pub mod driver;
pub mod gateway;
pub mod nightscout;
pub mod snapshot;
pub mod uplink;

pub use blynk::BlynkUplink;
pub use classify::{classify, Band, BolusSignal, BolusTracker, DerivedStatus, Severity};
pub use codes::SensorException;
pub use config::{AlertThresholds, ConfigError, CycleTiming, GatewayConfig};
pub use driver::{CnlBridgeSource, DriverError, TelemetrySource};
pub use gateway::{next_wake_delay, Gateway};
pub use nightscout::NightscoutUplink;
pub use snapshot::{CorrectedSnapshot, GlucoseReading, PumpAlerts, Snapshot};
pub use uplink::{UploadSink, UplinkError};
