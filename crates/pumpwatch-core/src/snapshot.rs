use std::ops::Deref;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::codes::SensorException;

/// One glucose field as reported by the bridge: either a real reading in
/// mg/dL or an exception marker sharing the same 16-bit encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum GlucoseReading {
    Value(u16),
    Exception(SensorException),
}

impl GlucoseReading {
    pub fn exception(self) -> Option<SensorException> {
        match self {
            GlucoseReading::Exception(code) => Some(code),
            GlucoseReading::Value(_) => None,
        }
    }

    pub fn value(self) -> Option<u16> {
        match self {
            GlucoseReading::Value(v) => Some(v),
            GlucoseReading::Exception(_) => None,
        }
    }
}

impl From<u16> for GlucoseReading {
    fn from(raw: u16) -> Self {
        match SensorException::from_raw(raw) {
            Some(code) => GlucoseReading::Exception(code),
            None => GlucoseReading::Value(raw),
        }
    }
}

impl From<GlucoseReading> for u16 {
    fn from(reading: GlucoseReading) -> Self {
        match reading {
            GlucoseReading::Value(v) => v,
            GlucoseReading::Exception(code) => code.raw(),
        }
    }
}

/// Independent alert flags mirrored from the pump status word.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PumpAlerts {
    #[serde(rename = "alertSuspend")]
    pub suspend: bool,
    #[serde(rename = "alertSuspendLow")]
    pub suspend_low: bool,
    #[serde(rename = "alertOnLow")]
    pub on_low: bool,
    #[serde(rename = "alertOnHigh")]
    pub on_high: bool,
    #[serde(rename = "alertBeforeLow")]
    pub before_low: bool,
    #[serde(rename = "alertBeforeHigh")]
    pub before_high: bool,
}

/// One telemetry read from the pump, as delivered by the bridge.
///
/// All timestamps carry the pump's own (drifted) clock until
/// [`Snapshot::correct_drift`] has run. Field names match the bridge's
/// JSON output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(rename = "sensorBGL")]
    pub sensor_bgl: GlucoseReading,
    #[serde(rename = "sensorBGLTimestamp")]
    pub sensor_bgl_timestamp: DateTime<Utc>,
    pub sensor_cal_minutes_remaining: i64,
    pub trend_arrow: String,
    pub pump_time: DateTime<Utc>,
    #[serde(rename = "pumpTimeDrift")]
    pub pump_time_drift_secs: i64,
    pub active_insulin: f64,
    pub last_bolus_amount: f64,
    pub last_bolus_time: DateTime<Utc>,
    pub insulin_units_remaining: f64,
    #[serde(rename = "batteryLevelPercentage")]
    pub battery_pct: u8,
    #[serde(rename = "sensorBatteryLevelPercentage")]
    pub sensor_battery_pct: u8,
    #[serde(rename = "pumpAlert")]
    pub alerts: PumpAlerts,
}

impl Snapshot {
    /// Folds the pump's reported clock drift into its timestamps,
    /// yielding true-clock values.
    ///
    /// Consumes the raw snapshot so a snapshot cannot be corrected twice.
    /// The sensor timestamp is left untouched when the sensor is lost;
    /// the pump reports a meaningless value there.
    pub fn correct_drift(mut self) -> CorrectedSnapshot {
        let drift = Duration::seconds(self.pump_time_drift_secs);
        self.pump_time += drift;
        if self.sensor_bgl != GlucoseReading::Exception(SensorException::Lost) {
            self.sensor_bgl_timestamp += drift;
        }
        CorrectedSnapshot(self)
    }
}

/// A snapshot whose timestamps have been shifted to true time.
#[derive(Debug, Clone, Serialize)]
pub struct CorrectedSnapshot(Snapshot);

impl Deref for CorrectedSnapshot {
    type Target = Snapshot;

    fn deref(&self) -> &Snapshot {
        &self.0
    }
}
