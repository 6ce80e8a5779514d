use chrono::{DateTime, Duration, Utc};

use crate::config::AlertThresholds;
use crate::snapshot::CorrectedSnapshot;

/// Overall alert tier for one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Normal,
    PreAlert,
    Alert,
    Suspended,
    SensorFault,
}

/// Three-band coloring for battery and reservoir gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Normal,
    Warning,
    Critical,
}

impl Band {
    fn grade(value: f64, warning_at: f64, critical_at: f64) -> Self {
        if value <= critical_at {
            Band::Critical
        } else if value <= warning_at {
            Band::Warning
        } else {
            Band::Normal
        }
    }
}

/// Which battery the alternating gauge shows this cycle.
#[derive(Debug, Clone)]
pub struct BatterySlot {
    pub label: &'static str,
    pub percent: u8,
    pub band: Band,
}

/// Outcome of the bolus-change check for one cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BolusSignal {
    /// A bolus was delivered since the last cycle; report its amount.
    RecentBolus(f64),
    /// No new bolus; report the current active insulin instead.
    ActiveInsulin(f64),
    /// A bolus timestamp changed but is too old to report. Nothing is
    /// emitted this cycle, not even active insulin; this mirrors the
    /// behavior the companion app has always shown.
    Quiet,
}

/// Carries the last observed bolus timestamp across cycles.
#[derive(Debug, Default)]
pub struct BolusTracker {
    last_bolus_epoch: Option<i64>,
}

impl BolusTracker {
    /// Window within which a newly observed bolus still counts as fresh.
    fn freshness_window(update_interval: Duration) -> Duration {
        update_interval * 2
    }

    pub fn observe(
        &mut self,
        snapshot: &CorrectedSnapshot,
        now: DateTime<Utc>,
        update_interval: Duration,
    ) -> BolusSignal {
        let bolus_epoch = snapshot.last_bolus_time.timestamp();
        if self.last_bolus_epoch == Some(bolus_epoch) {
            return BolusSignal::ActiveInsulin(snapshot.active_insulin);
        }

        self.last_bolus_epoch = Some(bolus_epoch);
        if now - snapshot.last_bolus_time < Self::freshness_window(update_interval) {
            BolusSignal::RecentBolus(snapshot.last_bolus_amount)
        } else {
            BolusSignal::Quiet
        }
    }
}

/// Everything the uplinks need beyond the snapshot itself. Computed per
/// cycle, never persisted.
#[derive(Debug, Clone)]
pub struct DerivedStatus {
    pub severity: Severity,
    pub status_text: String,
    pub trend_text: String,
    pub battery: BatterySlot,
    pub reservoir_units: i64,
    pub reservoir_band: Band,
    pub bolus: BolusSignal,
}

fn severity(snapshot: &CorrectedSnapshot, thresholds: &AlertThresholds) -> Severity {
    let Some(bgl) = snapshot.sensor_bgl.value() else {
        return Severity::SensorFault;
    };
    let alerts = &snapshot.alerts;

    // Ordered rule list, first match wins.
    let rules = [
        (alerts.suspend || alerts.suspend_low, Severity::Suspended),
        (
            bgl < thresholds.low || bgl > thresholds.high || alerts.on_low || alerts.on_high,
            Severity::Alert,
        ),
        (
            bgl < thresholds.pre_low
                || bgl > thresholds.pre_high
                || alerts.before_low
                || alerts.before_high,
            Severity::PreAlert,
        ),
    ];

    rules
        .into_iter()
        .find_map(|(matched, tier)| matched.then_some(tier))
        .unwrap_or(Severity::Normal)
}

/// Maps one corrected snapshot to its display/alert attributes.
///
/// `cycle_count` drives the battery alternation; `tracker` carries the
/// last-bolus state across cycles.
pub fn classify(
    snapshot: &CorrectedSnapshot,
    thresholds: &AlertThresholds,
    cycle_count: u64,
    tracker: &mut BolusTracker,
    now: DateTime<Utc>,
    update_interval: std::time::Duration,
) -> DerivedStatus {
    let severity = severity(snapshot, thresholds);

    let (status_text, trend_text) = match snapshot.sensor_bgl.exception() {
        Some(code) => (
            format!("{} - {}", now.format("%H:%M"), code.label()),
            format!("-- / {}", snapshot.active_insulin),
        ),
        None => {
            let cal_at =
                snapshot.sensor_bgl_timestamp + Duration::minutes(snapshot.sensor_cal_minutes_remaining);
            (
                format!(
                    "Updated {} - Cal at {}",
                    snapshot.sensor_bgl_timestamp.format("%H:%M"),
                    cal_at.format("%H:%M")
                ),
                format!("{} / {}", snapshot.trend_arrow, snapshot.active_insulin),
            )
        }
    };

    let (label, percent) = if cycle_count % 2 == 0 {
        ("PUMP BATTERY %", snapshot.battery_pct)
    } else {
        ("SENSOR BATTERY %", snapshot.sensor_battery_pct)
    };
    let battery = BatterySlot {
        label,
        percent,
        band: Band::grade(percent as f64, 50.0, 25.0),
    };

    let reservoir_band = Band::grade(snapshot.insulin_units_remaining, 75.0, 25.0);
    let bolus = tracker.observe(
        snapshot,
        now,
        Duration::from_std(update_interval).unwrap_or_else(|_| Duration::seconds(300)),
    );

    DerivedStatus {
        severity,
        status_text,
        trend_text,
        battery,
        reservoir_units: snapshot.insulin_units_remaining.round() as i64,
        reservoir_band,
        bolus,
    }
}
