/// Sensor exception markers reported by the pump in place of a glucose value.
///
/// The radio bridge encodes these in the same 16-bit field as a regular
/// reading, in a range (0x0301..=0x030D) far above any physiological value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorException {
    Init,
    CalNeeded,
    Error,
    CalError,
    ChangeSensor,
    EndOfLife,
    NotReady,
    ReadingHigh,
    ReadingLow,
    CalPending,
    ChangeCalError,
    TimeUnknown,
    Lost,
}

impl SensorException {
    pub const ALL: [SensorException; 13] = [
        SensorException::Init,
        SensorException::CalNeeded,
        SensorException::Error,
        SensorException::CalError,
        SensorException::ChangeSensor,
        SensorException::EndOfLife,
        SensorException::NotReady,
        SensorException::ReadingHigh,
        SensorException::ReadingLow,
        SensorException::CalPending,
        SensorException::ChangeCalError,
        SensorException::TimeUnknown,
        SensorException::Lost,
    ];

    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0x0301 => Some(SensorException::Init),
            0x0302 => Some(SensorException::CalNeeded),
            0x0303 => Some(SensorException::Error),
            0x0304 => Some(SensorException::CalError),
            0x0305 => Some(SensorException::ChangeSensor),
            0x0306 => Some(SensorException::EndOfLife),
            0x0307 => Some(SensorException::NotReady),
            0x0308 => Some(SensorException::ReadingHigh),
            0x0309 => Some(SensorException::ReadingLow),
            0x030A => Some(SensorException::CalPending),
            0x030B => Some(SensorException::ChangeCalError),
            0x030C => Some(SensorException::TimeUnknown),
            0x030D => Some(SensorException::Lost),
            _ => None,
        }
    }

    pub fn raw(self) -> u16 {
        match self {
            SensorException::Init => 0x0301,
            SensorException::CalNeeded => 0x0302,
            SensorException::Error => 0x0303,
            SensorException::CalError => 0x0304,
            SensorException::ChangeSensor => 0x0305,
            SensorException::EndOfLife => 0x0306,
            SensorException::NotReady => 0x0307,
            SensorException::ReadingHigh => 0x0308,
            SensorException::ReadingLow => 0x0309,
            SensorException::CalPending => 0x030A,
            SensorException::ChangeCalError => 0x030B,
            SensorException::TimeUnknown => 0x030C,
            SensorException::Lost => 0x030D,
        }
    }

    /// Canonical display string, as shown on the pump itself.
    pub fn label(self) -> &'static str {
        match self {
            SensorException::Init => "Sensor warming up",
            SensorException::CalNeeded => "Calibrate sensor now",
            SensorException::Error => "Updating sensor",
            SensorException::CalError => "Calibration error",
            SensorException::ChangeSensor => "Change sensor",
            SensorException::EndOfLife => "Sensor expired",
            SensorException::NotReady => "Sensor not ready",
            SensorException::ReadingHigh => "Sensor reading too high",
            SensorException::ReadingLow => "Sensor reading too low",
            SensorException::CalPending => "Calibrating sensor",
            SensorException::ChangeCalError => "Cal error - Change sensor",
            SensorException::TimeUnknown => "Time unknown",
            SensorException::Lost => "Sensor lost",
        }
    }
}
